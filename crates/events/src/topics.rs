//! Topic naming.

use runrelay_core::RunId;

/// Shared command channel consumed by the worker.
pub const COMMANDS_TOPIC: &str = "runs.commands";

/// Dead-letter channel for runs that exhausted their retry budget.
pub const DLQ_TOPIC: &str = "runs.dlq";

/// Prefix of each run's private event channel.
pub const EVENTS_PREFIX: &str = "runs.events.";

/// The private event channel of a run.
pub fn events_topic(run_id: &RunId) -> String {
    format!("{EVENTS_PREFIX}{run_id}")
}
