//! Infrastructure layer: broker gateway and the run orchestration engine.
//!
//! Control flow:
//!
//! - [`producer::CommandProducer`] registers runs and queues commands
//! - [`worker::Worker`] consumes commands and drives attempts, retries and dead-lettering
//! - [`broadcaster::EventBroadcaster`] fans per-run events out to live observers
//! - [`dlq::DlqIndexer`] shadows the dead-letter channel into a queryable cache
//!
//! Every component talks to the queue through [`broker::Broker`] only.

pub mod broadcaster;
pub mod broker;
pub mod dlq;
pub mod emitter;
pub mod producer;
pub mod registry;
pub mod worker;
pub mod workflow;

mod integration_tests;

pub use broadcaster::{BroadcasterConfig, EventBroadcaster, StreamItem};
pub use broker::{Broker, BrokerError, HttpBroker, HttpBrokerConfig, InMemoryBroker};
pub use dlq::{DlqCache, DlqIndexer, DlqIndexerConfig, DlqLookupError};
pub use emitter::EventEmitter;
pub use producer::{CommandProducer, CreatedRun, FailAtOverride, ProducerError, ReplayedRun};
pub use registry::{Run, RunRegistry};
pub use worker::{Outcome, RetryPolicy, Worker, WorkerConfig, WorkerStats};
pub use workflow::{AttemptError, SimulatedStep, StepFailure, StepRunner, WorkflowExecutor};
