//! Terminal failure records published to the dead-letter channel.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use runrelay_core::{DomainError, RunId};

use crate::{RunCommand, keys, now_ms};

const RECORD_TYPE: &str = "runs.dlq";

/// Reason recorded when the attempt bound is reached.
pub const REASON_MAX_ATTEMPTS: &str = "max_attempts";

fn record_type() -> String {
    RECORD_TYPE.to_string()
}

/// One record per terminally failed `(run, generation)`.
///
/// `command` is the original command payload, kept verbatim so a replay can
/// reuse it without re-deriving input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    #[serde(rename = "type", default = "record_type")]
    record_type: String,
    #[serde(default)]
    pub ts: i64,
    pub run_id: RunId,
    #[serde(default)]
    pub workflow: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub replay_seq: u64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub command: JsonValue,
}

impl DeadLetterRecord {
    /// Build the record for a command that failed its final attempt.
    pub fn max_attempts_exceeded(
        command: &RunCommand,
        payload: JsonValue,
        attempts: u32,
        max_attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            record_type: record_type(),
            ts: now_ms(),
            run_id: command.run_id.clone(),
            workflow: command.workflow.clone(),
            attempts,
            max_attempts,
            replay_seq: command.replay_seq,
            reason: REASON_MAX_ATTEMPTS.to_string(),
            error: error.into(),
            command: payload,
        }
    }

    /// Decode a record read back from the dead-letter channel.
    pub fn from_payload(payload: &JsonValue) -> Result<Self, DomainError> {
        let record: DeadLetterRecord = serde_json::from_value(payload.clone())
            .map_err(|e| DomainError::validation(format!("malformed dead letter: {e}")))?;

        if record.run_id.as_str().trim().is_empty() {
            return Err(DomainError::invalid_id("dead letter has blank run_id"));
        }

        Ok(record)
    }

    /// Deterministic idempotency key: `dlq:<run-id>:<generation>:<final-attempt>`.
    pub fn idempotency_key(&self) -> String {
        keys::dead_letter(&self.run_id, self.replay_seq, self.attempts)
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
