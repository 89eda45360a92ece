//! Run timeline events.
//!
//! Events are immutable and append-only; within one run they are ordered by
//! emission. On the wire every event is a flat JSON object:
//!
//! ```text
//! { "ts": 1718000000000, "type": "step.started", "run_id": "…", "step": "transform" }
//! ```

use serde::{Deserialize, Serialize};

use runrelay_core::{RunId, Step};

use crate::now_ms;

/// Kind-specific part of a [`RunEvent`], tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEventKind {
    #[serde(rename = "run.created")]
    RunCreated { workflow: String },

    #[serde(rename = "run.replay_requested")]
    ReplayRequested {
        replay_seq: u64,
        fail_at: Option<Step>,
    },

    #[serde(rename = "worker.received")]
    WorkerReceived { attempt: u32, replay_seq: u64 },

    #[serde(rename = "run.started")]
    RunStarted,

    #[serde(rename = "step.started")]
    StepStarted { step: Step },

    #[serde(rename = "step.completed")]
    StepCompleted { step: Step },

    /// A step's own work failed. Forced failures (`fail_at`) are reported
    /// through `run.attempt_failed` only.
    #[serde(rename = "step.failed")]
    StepFailed { step: Step, error: String },

    #[serde(rename = "run.attempt_failed")]
    AttemptFailed {
        attempt: u32,
        replay_seq: u64,
        error: String,
    },

    /// `attempt` is the number of the attempt that will run next.
    #[serde(rename = "run.retry_scheduled")]
    RetryScheduled {
        attempt: u32,
        replay_seq: u64,
        max_attempts: u32,
    },

    #[serde(rename = "run.dlq")]
    DeadLettered {
        replay_seq: u64,
        reason: String,
        dlq_topic: String,
        dlq_idem: String,
    },

    /// `reason` is set when the run was abandoned outside the normal
    /// dead-letter path (redelivery could not be requested).
    #[serde(rename = "run.failed")]
    RunFailed {
        replay_seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "run.succeeded")]
    RunSucceeded,
}

impl RunEventKind {
    /// The wire `type` of this event.
    pub fn type_name(&self) -> &'static str {
        match self {
            RunEventKind::RunCreated { .. } => "run.created",
            RunEventKind::ReplayRequested { .. } => "run.replay_requested",
            RunEventKind::WorkerReceived { .. } => "worker.received",
            RunEventKind::RunStarted => "run.started",
            RunEventKind::StepStarted { .. } => "step.started",
            RunEventKind::StepCompleted { .. } => "step.completed",
            RunEventKind::StepFailed { .. } => "step.failed",
            RunEventKind::AttemptFailed { .. } => "run.attempt_failed",
            RunEventKind::RetryScheduled { .. } => "run.retry_scheduled",
            RunEventKind::DeadLettered { .. } => "run.dlq",
            RunEventKind::RunFailed { .. } => "run.failed",
            RunEventKind::RunSucceeded => "run.succeeded",
        }
    }
}

/// A timestamped event on a run's private channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: i64,
    pub run_id: RunId,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

impl RunEvent {
    pub fn new(run_id: RunId, kind: RunEventKind) -> Self {
        Self {
            ts: now_ms(),
            run_id,
            kind,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn to_value(&self) -> serde_json::Value {
        // Every field is a plain string/number/enum; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_id() -> RunId {
        "r1".parse().unwrap()
    }

    #[test]
    fn wire_shape_is_flat() {
        let evt = RunEvent {
            ts: 42,
            run_id: run_id(),
            kind: RunEventKind::StepStarted {
                step: Step::Transform,
            },
        };

        assert_eq!(
            evt.to_value(),
            json!({"ts": 42, "type": "step.started", "run_id": "r1", "step": "transform"})
        );
    }

    #[test]
    fn unit_kinds_carry_only_the_type() {
        let evt = RunEvent {
            ts: 1,
            run_id: run_id(),
            kind: RunEventKind::RunSucceeded,
        };
        assert_eq!(
            evt.to_value(),
            json!({"ts": 1, "type": "run.succeeded", "run_id": "r1"})
        );
    }

    #[test]
    fn decodes_from_wire() {
        let raw = json!({
            "ts": 7,
            "type": "run.retry_scheduled",
            "run_id": "r1",
            "attempt": 2,
            "replay_seq": 0,
            "max_attempts": 3
        });
        let evt: RunEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(
            evt.kind,
            RunEventKind::RetryScheduled {
                attempt: 2,
                replay_seq: 0,
                max_attempts: 3
            }
        );
    }

    #[test]
    fn run_failed_reason_is_omitted_when_absent() {
        let plain = RunEvent {
            ts: 3,
            run_id: run_id(),
            kind: RunEventKind::RunFailed { replay_seq: 1, reason: None },
        };
        assert_eq!(
            plain.to_value(),
            json!({"ts": 3, "type": "run.failed", "run_id": "r1", "replay_seq": 1})
        );

        let abandoned = RunEvent {
            ts: 3,
            run_id: run_id(),
            kind: RunEventKind::RunFailed {
                replay_seq: 1,
                reason: Some("redelivery_unavailable".into()),
            },
        };
        assert_eq!(abandoned.to_value()["reason"], "redelivery_unavailable");
    }

    #[test]
    fn type_name_matches_serialized_tag() {
        let kinds = vec![
            RunEventKind::RunCreated { workflow: "demo".into() },
            RunEventKind::ReplayRequested { replay_seq: 1, fail_at: None },
            RunEventKind::WorkerReceived { attempt: 1, replay_seq: 0 },
            RunEventKind::RunStarted,
            RunEventKind::StepStarted { step: Step::FetchInput },
            RunEventKind::StepCompleted { step: Step::FetchInput },
            RunEventKind::StepFailed { step: Step::ToolCall, error: "boom".into() },
            RunEventKind::AttemptFailed { attempt: 1, replay_seq: 0, error: "boom".into() },
            RunEventKind::RetryScheduled { attempt: 2, replay_seq: 0, max_attempts: 3 },
            RunEventKind::DeadLettered {
                replay_seq: 0,
                reason: "max_attempts".into(),
                dlq_topic: "runs.dlq".into(),
                dlq_idem: "dlq:r1:0:3".into(),
            },
            RunEventKind::RunFailed { replay_seq: 0, reason: None },
            RunEventKind::RunSucceeded,
        ];

        for kind in kinds {
            let value = RunEvent::new(run_id(), kind.clone()).to_value();
            assert_eq!(value["type"], json!(kind.type_name()));
        }
    }
}
