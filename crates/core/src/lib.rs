//! `runrelay-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! run identifiers, the fixed workflow step vocabulary and the domain error model.

pub mod error;
pub mod id;
pub mod step;

pub use error::{DomainError, DomainResult};
pub use id::RunId;
pub use step::Step;
