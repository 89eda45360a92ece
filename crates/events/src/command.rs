//! The unit of work consumed by the worker.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use runrelay_core::{DomainError, RunId, Step};

use crate::{keys, now_ms};

const RECORD_TYPE: &str = "run.command";

fn record_type() -> String {
    RECORD_TYPE.to_string()
}

fn default_workflow() -> String {
    "demo".to_string()
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

/// Command that executes one generation of a run.
///
/// Decoding is lenient about everything except the run identifier: missing
/// `workflow`, `input`, `fail_at` or `replay_seq` fall back to their defaults,
/// mirroring what producers omit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    #[serde(rename = "type", default = "record_type")]
    record_type: String,
    #[serde(default)]
    pub ts: i64,
    pub run_id: RunId,
    #[serde(default = "default_workflow")]
    pub workflow: String,
    #[serde(default = "empty_object")]
    pub input: JsonValue,
    #[serde(default)]
    pub fail_at: Option<Step>,
    #[serde(default)]
    pub replay_seq: u64,
}

impl RunCommand {
    pub fn new(
        run_id: RunId,
        workflow: impl Into<String>,
        input: JsonValue,
        fail_at: Option<Step>,
        replay_seq: u64,
    ) -> Self {
        Self {
            record_type: record_type(),
            ts: now_ms(),
            run_id,
            workflow: workflow.into(),
            input,
            fail_at,
            replay_seq,
        }
    }

    /// Decode a command from an extracted broker payload.
    ///
    /// Fails for anything the worker cannot act on: non-objects, a missing or
    /// blank `run_id`, or a `fail_at` outside the step vocabulary.
    pub fn from_payload(payload: &JsonValue) -> Result<Self, DomainError> {
        let command: RunCommand = serde_json::from_value(payload.clone())
            .map_err(|e| DomainError::validation(format!("malformed command: {e}")))?;

        if command.run_id.as_str().trim().is_empty() {
            return Err(DomainError::invalid_id("command has blank run_id"));
        }

        Ok(command)
    }

    /// Deterministic idempotency key: `cmd:<run-id>:<generation>`.
    pub fn idempotency_key(&self) -> String {
        keys::command(&self.run_id, self.replay_seq)
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
