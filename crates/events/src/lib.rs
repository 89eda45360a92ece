//! Run lifecycle records exchanged over the broker.
//!
//! Everything that crosses a topic boundary lives here:
//! - [`RunCommand`]: the unit of work on `runs.commands`
//! - [`RunEvent`]: timeline entries on `runs.events.<run-id>`
//! - [`DeadLetterRecord`]: terminal failures on `runs.dlq`
//! - [`keys`]: deterministic idempotency keys tying records to their logical identity

pub mod command;
pub mod dead_letter;
pub mod event;
pub mod keys;
pub mod topics;

pub use command::RunCommand;
pub use dead_letter::DeadLetterRecord;
pub use event::{RunEvent, RunEventKind};
pub use topics::{COMMANDS_TOPIC, DLQ_TOPIC, EVENTS_PREFIX, events_topic};

/// Milliseconds since the Unix epoch, the timestamp unit of every record.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
