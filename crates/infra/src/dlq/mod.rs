//! Dead-letter channel shadowing.

pub mod cache;
pub mod indexer;

pub use cache::{DlqCache, DlqLookupError, RecencyCache};
pub use indexer::{DlqIndexer, DlqIndexerConfig};
