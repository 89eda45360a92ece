//! Command producer: turns create/replay requests into broker records.
//!
//! Each request yields exactly one lifecycle event on the run's channel and one
//! command on `runs.commands`, both keyed deterministically:
//!
//! | request | event key                     | command key              |
//! |---------|-------------------------------|--------------------------|
//! | create  | `evt:<run>:created`           | `cmd:<run>:0`            |
//! | replay  | `evt:<run>:replay:<seq>`      | `cmd:<run>:<seq>`        |
//!
//! so a retried production of the same generation is absorbed by the broker.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use runrelay_core::{RunId, Step};
use runrelay_events::{COMMANDS_TOPIC, RunCommand, RunEventKind, events_topic, keys};

use crate::broker::{Broker, BrokerError};
use crate::emitter::EventEmitter;
use crate::registry::{Run, RunRegistry};

/// Producer error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProducerError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    /// The broker rejected or could not be reached for a produce/ensure call.
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] BrokerError),
}

/// Replay's failure-injection override.
///
/// Three-valued on purpose: "not mentioned" and "explicitly none" mean
/// different things.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailAtOverride {
    /// Keep the run's stored failure-injection point.
    #[default]
    Inherit,
    /// Run this generation without failure injection.
    Clear,
    /// Fail this generation at the given step.
    Set(Step),
}

impl FailAtOverride {
    /// `None` = absent, `Some(None)` = explicit null, `Some(Some(step))` = value.
    pub fn from_explicit(value: Option<Option<Step>>) -> Self {
        match value {
            None => FailAtOverride::Inherit,
            Some(None) => FailAtOverride::Clear,
            Some(Some(step)) => FailAtOverride::Set(step),
        }
    }

    pub fn resolve(self, stored: Option<Step>) -> Option<Step> {
        match self {
            FailAtOverride::Inherit => stored,
            FailAtOverride::Clear => None,
            FailAtOverride::Set(step) => Some(step),
        }
    }
}

/// Result of a create request.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedRun {
    pub run_id: RunId,
    pub events_topic: String,
}

/// Result of a replay request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayedRun {
    pub run_id: RunId,
    /// The new generation.
    pub seq: u64,
    /// Effective failure-injection point of this generation.
    pub fail_at: Option<Step>,
}

#[derive(Clone)]
pub struct CommandProducer {
    registry: RunRegistry,
    emitter: EventEmitter,
}

impl CommandProducer {
    pub fn new(registry: RunRegistry, emitter: EventEmitter) -> Self {
        Self { registry, emitter }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    fn broker(&self) -> &Arc<dyn Broker> {
        self.emitter.broker()
    }

    async fn enqueue(&self, command: &RunCommand) -> Result<(), BrokerError> {
        let key = command.idempotency_key();
        self.broker()
            .produce(COMMANDS_TOPIC, &command.to_value(), Some(&key))
            .await
    }

    /// Register a new run and queue its generation-0 command.
    ///
    /// The run is registered before anything is produced; when production
    /// fails the entry stays and the caller sees `Upstream`.
    #[instrument(skip(self, input), err)]
    pub async fn create(
        &self,
        workflow: &str,
        input: JsonValue,
        fail_at: Option<Step>,
    ) -> Result<CreatedRun, ProducerError> {
        self.broker().ensure_topic(COMMANDS_TOPIC).await?;

        let run = Run::new(workflow, input, fail_at);
        let run_id = run.run_id.clone();
        let command = RunCommand::new(run_id.clone(), workflow, run.input.clone(), fail_at, 0);
        self.registry.insert(run).await;

        self.emitter
            .emit(
                &run_id,
                RunEventKind::RunCreated {
                    workflow: workflow.to_string(),
                },
                Some(&keys::created(&run_id)),
            )
            .await?;
        self.enqueue(&command).await?;

        info!(run_id = %run_id, workflow, fail_at = ?fail_at, "run created");
        Ok(CreatedRun {
            events_topic: events_topic(&run_id),
            run_id,
        })
    }

    /// Queue a new generation of an existing run.
    ///
    /// The stored `fail_at` is never rewritten; the override applies to this
    /// generation only.
    #[instrument(skip(self), err)]
    pub async fn replay(&self, run_id: &RunId, fail_at: FailAtOverride) -> Result<ReplayedRun, ProducerError> {
        let run = self
            .registry
            .begin_replay(run_id)
            .await
            .map_err(|_| ProducerError::NotFound(run_id.clone()))?;

        let seq = run.replay_seq;
        let effective = fail_at.resolve(run.fail_at);
        let command = RunCommand::new(run_id.clone(), run.workflow.clone(), run.input.clone(), effective, seq);

        self.broker().ensure_topic(COMMANDS_TOPIC).await?;
        self.emitter
            .emit(
                run_id,
                RunEventKind::ReplayRequested {
                    replay_seq: seq,
                    fail_at: effective,
                },
                Some(&keys::replay_requested(run_id, seq)),
            )
            .await?;
        self.enqueue(&command).await?;

        info!(run_id = %run_id, replay_seq = seq, fail_at = ?effective, "replay requested");
        Ok(ReplayedRun {
            run_id: run_id.clone(),
            seq,
            fail_at: effective,
        })
    }

    /// Publish an arbitrary record onto a known run's channel.
    pub async fn emit(&self, run_id: &RunId, event: &JsonValue) -> Result<(), ProducerError> {
        if !self.registry.contains(run_id).await {
            return Err(ProducerError::NotFound(run_id.clone()));
        }
        self.emitter.emit_value(run_id, event, None).await?;
        Ok(())
    }

    pub async fn lookup(&self, run_id: &RunId) -> Result<Run, ProducerError> {
        self.registry
            .get(run_id)
            .await
            .ok_or_else(|| ProducerError::NotFound(run_id.clone()))
    }
}

impl std::fmt::Debug for CommandProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProducer").finish_non_exhaustive()
    }
}
