//! Worker loop: the attempt / retry / dead-letter state machine.
//!
//! A single sequential consumer of `runs.commands`. Per `(run, generation)`:
//!
//! ```text
//! Idle --dequeue--> Attempting --ok--> Succeeded      (ack, counter cleared)
//!                        |
//!                        +--fail, attempt < max--> RetryScheduled (backoff, nack)
//!                        |
//!                        +--fail, attempt = max--> DeadLettered   (dlq record, ack, counter cleared)
//! ```
//!
//! Malformed commands are acked and dropped. Ack/nack failures never stop the
//! loop; the attempt counters here are the source of truth, not broker leases.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use runrelay_events::{COMMANDS_TOPIC, DLQ_TOPIC, DeadLetterRecord, RunCommand, RunEventKind};

use crate::broker::{Broker, BrokerError, ConsumeOptions, LeasedMessage, safe_ack, safe_nack};
use crate::emitter::EventEmitter;
use crate::workflow::WorkflowExecutor;

pub mod attempts;
pub mod policy;

pub use attempts::{AttemptKey, AttemptTracker};
pub use policy::RetryPolicy;

/// `run.failed` reason when a retry could be neither nacked nor kept.
pub const REASON_REDELIVERY_UNAVAILABLE: &str = "redelivery_unavailable";

/// `run.failed` reason when the dead-letter record could not be published
/// and the command could not be released for another try.
pub const REASON_DEAD_LETTER_UNAVAILABLE: &str = "dead_letter_unavailable";

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer group on the command channel
    pub group: String,
    /// Lease owner (defaults to the group)
    pub owner: Option<String>,
    /// Lease duration of each delivered command
    pub lease: Duration,
    /// Consume idle timeout before the stream is re-opened
    pub idle_timeout: Duration,
    /// Pause before re-opening after a broker error
    pub reconnect_delay: Duration,
    /// Attempt bound and backoff
    pub policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: "demo-worker".to_string(),
            owner: None,
            lease: Duration::from_millis(30_000),
            idle_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
            policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn consume_options(&self) -> ConsumeOptions {
        let options = ConsumeOptions::default()
            .with_lease(self.lease)
            .with_idle_timeout(self.idle_timeout);
        match &self.owner {
            Some(owner) => options.with_owner(owner.clone()),
            None => options,
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub commands_received: u64,
    pub runs_succeeded: u64,
    pub attempts_failed: u64,
    pub retries_scheduled: u64,
    pub runs_dead_lettered: u64,
    pub dead_letters_deferred: u64,
    pub runs_abandoned: u64,
    pub commands_dropped: u64,
}

/// What happened to one delivered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The attempt succeeded; command acked.
    Succeeded,
    /// The attempt failed and the command was nacked for `next_attempt`.
    RetryScheduled { next_attempt: u32 },
    /// The attempt failed, redelivery could not be requested; command acked.
    RetryAbandoned,
    /// The final attempt failed; dead-letter record published, command acked.
    DeadLettered { dlq_idem: String },
    /// The dead-letter record could not be published; command nacked so the
    /// publish is retried on redelivery.
    DeadLetterDeferred,
    /// Unprocessable payload; command acked without processing.
    Dropped,
}

/// Sequential command consumer.
pub struct Worker {
    broker: Arc<dyn Broker>,
    emitter: EventEmitter,
    executor: WorkflowExecutor,
    config: WorkerConfig,
    attempts: AttemptTracker,
    deferred: HashMap<AttemptKey, DeadLetterRecord>,
    stats: WorkerStats,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(emitter: EventEmitter, executor: WorkflowExecutor, config: WorkerConfig) -> Self {
        Self {
            broker: emitter.broker().clone(),
            emitter,
            executor,
            config,
            attempts: AttemptTracker::new(),
            deferred: HashMap::new(),
            stats: WorkerStats::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that shortens backoff waits and stops consumption.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.clone()
    }

    pub fn attempts(&self) -> &AttemptTracker {
        &self.attempts
    }

    async fn ack(&self, message: &LeasedMessage) -> bool {
        safe_ack(self.broker.as_ref(), COMMANDS_TOPIC, &self.config.group, message).await
    }

    async fn nack(&self, message: &LeasedMessage) -> bool {
        safe_nack(self.broker.as_ref(), COMMANDS_TOPIC, &self.config.group, message).await
    }

    /// Drive one delivered command through the state machine.
    pub async fn handle(&mut self, message: &LeasedMessage) -> Outcome {
        self.stats.commands_received += 1;

        let payload = message.extract_value().unwrap_or_else(|| JsonValue::Object(Default::default()));
        let command = match RunCommand::from_payload(&payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(offset = message.offset, error = %e, "dropping malformed command");
                self.ack(message).await;
                self.stats.commands_dropped += 1;
                return Outcome::Dropped;
            }
        };

        let key = AttemptKey::new(command.run_id.clone(), command.replay_seq);

        // A generation whose dead-letter publish failed goes straight back to
        // publishing; its attempt budget is already spent.
        if let Some(record) = self.deferred.remove(&key) {
            debug!(run_id = %key.run_id, replay_seq = key.replay_seq, "retrying deferred dead letter");
            return self.dead_letter(message, &key, record).await;
        }

        let attempt = self.attempts.begin(&key);
        info!(
            run_id = %command.run_id,
            replay_seq = command.replay_seq,
            attempt,
            "command received"
        );

        match self.attempt(&command, attempt).await {
            Ok(()) => {
                self.ack(message).await;
                self.attempts.clear(&key);
                self.stats.runs_succeeded += 1;
                info!(run_id = %command.run_id, replay_seq = command.replay_seq, attempt, "run succeeded");
                Outcome::Succeeded
            }
            Err(error) => self.on_failure(message, &command, payload, &key, attempt, error).await,
        }
    }

    async fn attempt(&self, command: &RunCommand, attempt: u32) -> Result<(), crate::workflow::AttemptError> {
        self.emitter
            .emit(
                &command.run_id,
                RunEventKind::WorkerReceived {
                    attempt,
                    replay_seq: command.replay_seq,
                },
                None,
            )
            .await?;
        self.executor.execute(command).await
    }

    async fn on_failure(
        &mut self,
        message: &LeasedMessage,
        command: &RunCommand,
        payload: JsonValue,
        key: &AttemptKey,
        attempt: u32,
        error: crate::workflow::AttemptError,
    ) -> Outcome {
        let error = error.to_string();
        let run_id = &command.run_id;
        let replay_seq = command.replay_seq;
        let max_attempts = self.config.policy.max_attempts;

        self.stats.attempts_failed += 1;
        warn!(run_id = %run_id, replay_seq, attempt, error = %error, "attempt failed");
        self.emitter
            .emit_or_log(
                run_id,
                RunEventKind::AttemptFailed {
                    attempt,
                    replay_seq,
                    error: error.clone(),
                },
            )
            .await;

        if self.config.policy.should_retry(attempt) {
            self.emitter
                .emit_or_log(
                    run_id,
                    RunEventKind::RetryScheduled {
                        attempt: attempt + 1,
                        replay_seq,
                        max_attempts,
                    },
                )
                .await;

            let delay = self.config.policy.delay_for_attempt(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    debug!(run_id = %run_id, "backoff cut short by shutdown");
                }
            }

            if self.nack(message).await {
                self.stats.retries_scheduled += 1;
                info!(run_id = %run_id, replay_seq, next_attempt = attempt + 1, "retry scheduled");
                return Outcome::RetryScheduled {
                    next_attempt: attempt + 1,
                };
            }

            // Redelivery is broken: settle the command so the loop cannot spin,
            // and say so on the run's timeline.
            self.ack(message).await;
            self.attempts.clear(key);
            self.stats.runs_abandoned += 1;
            warn!(run_id = %run_id, replay_seq, attempt, "nack failed, retry abandoned");
            self.emitter
                .emit_or_log(
                    run_id,
                    RunEventKind::RunFailed {
                        replay_seq,
                        reason: Some(REASON_REDELIVERY_UNAVAILABLE.to_string()),
                    },
                )
                .await;
            return Outcome::RetryAbandoned;
        }

        let record = DeadLetterRecord::max_attempts_exceeded(command, payload, attempt, max_attempts, error);
        self.dead_letter(message, key, record).await
    }

    async fn publish_dead_letter(&self, record: &DeadLetterRecord) -> Result<String, BrokerError> {
        let dlq_idem = record.idempotency_key();
        self.broker.ensure_topic(DLQ_TOPIC).await?;
        self.broker
            .produce(DLQ_TOPIC, &record.to_value(), Some(&dlq_idem))
            .await?;
        Ok(dlq_idem)
    }

    async fn dead_letter(&mut self, message: &LeasedMessage, key: &AttemptKey, record: DeadLetterRecord) -> Outcome {
        let run_id = record.run_id.clone();
        let replay_seq = record.replay_seq;

        match self.publish_dead_letter(&record).await {
            Ok(dlq_idem) => {
                self.emitter
                    .emit_or_log(
                        &run_id,
                        RunEventKind::DeadLettered {
                            replay_seq,
                            reason: record.reason.clone(),
                            dlq_topic: DLQ_TOPIC.to_string(),
                            dlq_idem: dlq_idem.clone(),
                        },
                    )
                    .await;
                self.emitter
                    .emit_or_log(&run_id, RunEventKind::RunFailed { replay_seq, reason: None })
                    .await;

                self.ack(message).await;
                self.attempts.clear(key);
                self.stats.runs_dead_lettered += 1;
                warn!(run_id = %run_id, replay_seq, attempts = record.attempts, dlq_idem = %dlq_idem, "run dead-lettered");
                Outcome::DeadLettered { dlq_idem }
            }
            Err(e) => {
                warn!(run_id = %run_id, replay_seq, error = %e, "dead-letter publish failed");
                if self.nack(message).await {
                    self.deferred.insert(key.clone(), record);
                    self.stats.dead_letters_deferred += 1;
                    return Outcome::DeadLetterDeferred;
                }

                self.ack(message).await;
                self.attempts.clear(key);
                self.stats.runs_abandoned += 1;
                self.emitter
                    .emit_or_log(
                        &run_id,
                        RunEventKind::RunFailed {
                            replay_seq,
                            reason: Some(REASON_DEAD_LETTER_UNAVAILABLE.to_string()),
                        },
                    )
                    .await;
                Outcome::RetryAbandoned
            }
        }
    }

    /// Consume until the stream goes idle or the worker is cancelled.
    ///
    /// Returns the number of commands handled. A command already being handled
    /// when cancellation fires is still settled before returning.
    pub async fn run_until_idle(&mut self) -> Result<u64, BrokerError> {
        let mut stream = self
            .broker
            .consume_stream(COMMANDS_TOPIC, &self.config.group, self.config.consume_options());
        let mut handled = 0;

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = self.cancel.cancelled() => return Ok(handled),
            };

            match next {
                Some(Ok(message)) => {
                    self.handle(&message).await;
                    handled += 1;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(handled),
            }
        }
    }

    /// Long-running loop: re-opens the consume stream until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerStats {
        self.cancel = cancel;
        info!(group = %self.config.group, topic = COMMANDS_TOPIC, "worker started");

        while !self.cancel.is_cancelled() {
            let result = match self.ensure_topics().await {
                Ok(()) => self.run_until_idle().await,
                Err(e) => Err(e),
            };

            match result {
                Ok(handled) => debug!(handled, "consume stream idle, re-opening"),
                Err(e) => {
                    warn!(error = %e, "worker consume failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
            }
        }

        info!(group = %self.config.group, stats = ?self.stats, "worker stopped");
        self.stats
    }

    async fn ensure_topics(&self) -> Result<(), BrokerError> {
        self.broker.ensure_topic(COMMANDS_TOPIC).await?;
        self.broker.ensure_topic(DLQ_TOPIC).await
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
