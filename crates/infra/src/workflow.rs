//! Workflow executor: runs one attempt of a command.
//!
//! The executor walks the fixed step sequence, emitting progress events as it
//! goes. It never retries; a failed attempt is reported to the caller (the
//! worker) which owns the attempt/retry/dead-letter decisions.
//!
//! Event sequence of one attempt:
//!
//! - success: `run.started`, (`step.started`, `step.completed`) per step, `run.succeeded`
//! - forced failure at step S: `run.started`, (`step.started`, `step.completed`) for
//!   every step before S, then `step.started` for S and nothing else
//! - runner failure at step S: as above, followed by `step.failed` for S

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use runrelay_core::Step;
use runrelay_events::{RunCommand, RunEventKind};

use crate::broker::BrokerError;
use crate::emitter::EventEmitter;

/// A workflow step failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
    /// The command asked for a failure at this step.
    #[error("forced failure at {0}")]
    Injected(Step),

    /// The step's own work failed.
    #[error("step {step} failed: {message}")]
    Failed { step: Step, message: String },
}

impl StepFailure {
    pub fn step(&self) -> Step {
        match self {
            StepFailure::Injected(step) => *step,
            StepFailure::Failed { step, .. } => *step,
        }
    }
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Step(#[from] StepFailure),

    /// A progress event could not be published.
    #[error("event emission failed: {0}")]
    Emit(#[from] BrokerError),
}

/// The work performed by one step.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, step: Step, command: &RunCommand) -> Result<(), StepFailure>;
}

/// Stand-in step work: waits a fixed delay and succeeds.
#[derive(Debug, Clone)]
pub struct SimulatedStep {
    delay: Duration,
}

impl SimulatedStep {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedStep {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

#[async_trait]
impl StepRunner for SimulatedStep {
    async fn run(&self, _step: Step, _command: &RunCommand) -> Result<(), StepFailure> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

/// Executes a single attempt.
#[derive(Clone)]
pub struct WorkflowExecutor {
    emitter: EventEmitter,
    runner: Arc<dyn StepRunner>,
}

impl WorkflowExecutor {
    pub fn new(emitter: EventEmitter, runner: Arc<dyn StepRunner>) -> Self {
        Self { emitter, runner }
    }

    pub fn simulated(emitter: EventEmitter, step_delay: Duration) -> Self {
        Self::new(emitter, Arc::new(SimulatedStep::new(step_delay)))
    }

    pub async fn execute(&self, command: &RunCommand) -> Result<(), AttemptError> {
        let run_id = &command.run_id;
        self.emitter.emit(run_id, RunEventKind::RunStarted, None).await?;

        for step in Step::ALL {
            self.emitter
                .emit(run_id, RunEventKind::StepStarted { step }, None)
                .await?;

            if command.fail_at == Some(step) {
                return Err(StepFailure::Injected(step).into());
            }

            if let Err(failure) = self.runner.run(step, command).await {
                let error = failure.to_string();
                self.emitter
                    .emit(run_id, RunEventKind::StepFailed { step, error }, None)
                    .await?;
                return Err(failure.into());
            }

            self.emitter
                .emit(run_id, RunEventKind::StepCompleted { step }, None)
                .await?;
        }

        self.emitter.emit(run_id, RunEventKind::RunSucceeded, None).await?;
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor").finish_non_exhaustive()
    }
}
