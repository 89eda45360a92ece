//! End-to-end tests of the orchestration engine against the in-memory broker.
//!
//! Pipeline: CommandProducer → runs.commands → Worker → runs.events.<run> / runs.dlq
//! → DlqIndexer → EventBroadcaster
//!
//! Verifies:
//! - success and exhausted-retry timelines
//! - attempt accounting per (run, generation)
//! - replay semantics (cleared failure injection, fresh attempt budget)
//! - duplicate suppression through idempotency keys
//! - the nack / dead-letter fallbacks when the broker misbehaves

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{Value as JsonValue, json};

    use runrelay_core::{RunId, Step};
    use runrelay_events::{COMMANDS_TOPIC, DLQ_TOPIC, RunCommand, events_topic};

    use crate::broadcaster::{BroadcasterConfig, EventBroadcaster, StreamItem};
    use crate::broker::{Broker, BrokerError, ConsumeOptions, InMemoryBroker, LeasedMessage, MessageStream};
    use crate::dlq::{DlqCache, DlqIndexer, DlqIndexerConfig};
    use crate::emitter::EventEmitter;
    use crate::producer::{CommandProducer, FailAtOverride};
    use crate::registry::RunRegistry;
    use crate::worker::{AttemptKey, Worker, WorkerConfig};
    use crate::workflow::WorkflowExecutor;

    /// Wraps the in-memory broker and breaks selected operations.
    struct FlakyBroker {
        inner: InMemoryBroker,
        fail_nacks: bool,
        failing_dlq_produces: AtomicU32,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn healthz(&self) -> Result<JsonValue, BrokerError> {
            self.inner.healthz().await
        }

        async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
            self.inner.ensure_topic(topic).await
        }

        async fn produce(&self, topic: &str, value: &JsonValue, key: Option<&str>) -> Result<(), BrokerError> {
            if topic == DLQ_TOPIC
                && self
                    .failing_dlq_produces
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(BrokerError::Unavailable("dlq down".into()));
            }
            self.inner.produce(topic, value, key).await
        }

        fn consume_stream(&self, topic: &str, group: &str, options: ConsumeOptions) -> MessageStream {
            self.inner.consume_stream(topic, group, options)
        }

        async fn ack(&self, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError> {
            self.inner.ack(topic, group, message).await
        }

        async fn nack(&self, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError> {
            if self.fail_nacks {
                return Err(BrokerError::Unavailable("nack down".into()));
            }
            self.inner.nack(topic, group, message).await
        }
    }

    struct Harness {
        broker: InMemoryBroker,
        producer: CommandProducer,
        worker: Worker,
        dlq: DlqCache,
        indexer: DlqIndexer,
        broadcaster: EventBroadcaster,
    }

    fn harness_on(broker: InMemoryBroker, gateway: Arc<dyn Broker>) -> Harness {
        let emitter = EventEmitter::new(gateway.clone());
        let producer = CommandProducer::new(RunRegistry::new(), emitter.clone());
        let executor = WorkflowExecutor::simulated(emitter.clone(), Duration::from_millis(200));
        let worker = Worker::new(
            emitter,
            executor,
            WorkerConfig::default().with_idle_timeout(Duration::from_millis(100)),
        );
        let dlq = DlqCache::new(100);
        let indexer = DlqIndexer::new(
            gateway.clone(),
            dlq.clone(),
            DlqIndexerConfig::default().with_idle_timeout(Duration::from_millis(100)),
        );
        let broadcaster = EventBroadcaster::new(
            gateway,
            dlq.clone(),
            BroadcasterConfig::default().with_keep_alive(Duration::from_millis(100)),
        );

        Harness {
            broker,
            producer,
            worker,
            dlq,
            indexer,
            broadcaster,
        }
    }

    fn harness() -> Harness {
        let broker = InMemoryBroker::new();
        harness_on(broker.clone(), Arc::new(broker))
    }

    fn flaky_harness(fail_nacks: bool, failing_dlq_produces: u32) -> Harness {
        let broker = InMemoryBroker::new();
        let flaky = FlakyBroker {
            inner: broker.clone(),
            fail_nacks,
            failing_dlq_produces: AtomicU32::new(failing_dlq_produces),
        };
        harness_on(broker, Arc::new(flaky))
    }

    async fn event_types(broker: &InMemoryBroker, run_id: &RunId) -> Vec<String> {
        broker
            .records(&events_topic(run_id))
            .await
            .iter()
            .map(|e| e["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn count(types: &[String], ty: &str) -> usize {
        types.iter().filter(|t| t.as_str() == ty).count()
    }

    #[tokio::test(start_paused = true)]
    async fn clean_run_succeeds() {
        let mut h = harness();
        let created = h.producer.create("demo", json!({"hello": "world"}), None).await.unwrap();

        assert_eq!(h.worker.run_until_idle().await.unwrap(), 1);

        let types = event_types(&h.broker, &created.run_id).await;
        assert_eq!(types.first().map(String::as_str), Some("run.created"));
        assert_eq!(types.last().map(String::as_str), Some("run.succeeded"));
        assert_eq!(count(&types, "step.completed"), 4);
        assert_eq!(count(&types, "run.attempt_failed"), 0);
        assert!(h.broker.records(DLQ_TOPIC).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter_once() {
        let mut h = harness();
        let created = h
            .producer
            .create("demo", json!({"k": "v"}), Some(Step::Transform))
            .await
            .unwrap();

        assert_eq!(h.worker.run_until_idle().await.unwrap(), 3);

        let types = event_types(&h.broker, &created.run_id).await;
        assert_eq!(count(&types, "worker.received"), 3);
        assert_eq!(count(&types, "run.attempt_failed"), 3);
        assert_eq!(count(&types, "run.retry_scheduled"), 2);
        assert_eq!(count(&types, "run.dlq"), 1);
        assert_eq!(count(&types, "run.failed"), 1);
        assert_eq!(count(&types, "run.succeeded"), 0);
        assert_eq!(&types[types.len() - 2..], ["run.dlq", "run.failed"]);

        let original = h.broker.records(COMMANDS_TOPIC).await.remove(0);
        let dead = h.broker.records(DLQ_TOPIC).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0]["type"], "runs.dlq");
        assert_eq!(dead[0]["attempts"], 3);
        assert_eq!(dead[0]["max_attempts"], 3);
        assert_eq!(dead[0]["reason"], "max_attempts");
        assert_eq!(dead[0]["error"], "forced failure at transform");
        assert_eq!(dead[0]["command"], original);

        let events = h.broker.records(&created.events_topic).await;
        let dlq_event = events.iter().find(|e| e["type"] == "run.dlq").unwrap();
        assert_eq!(dlq_event["dlq_idem"], format!("dlq:{}:0:3", created.run_id));
        assert_eq!(dlq_event["dlq_topic"], "runs.dlq");
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_accounting_after_max_failures() {
        let mut h = harness();
        let created = h.producer.create("demo", json!({}), Some(Step::ToolCall)).await.unwrap();

        h.worker.run_until_idle().await.unwrap();

        let max = h.worker.config().policy.max_attempts as u64;
        assert_eq!(h.broker.nack_count().await, max - 1);
        assert_eq!(h.broker.ack_count().await, 1);
        assert_eq!(h.broker.records(DLQ_TOPIC).await.len(), 1);
        assert_eq!(h.worker.attempts().current(&AttemptKey::new(created.run_id, 0)), None);
        assert!(h.worker.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_attempts_are_numbered_and_backed_off() {
        let mut h = harness();
        let created = h.producer.create("demo", json!({}), Some(Step::FetchInput)).await.unwrap();

        let started = tokio::time::Instant::now();
        h.worker.run_until_idle().await.unwrap();
        // 300ms after attempt 1, 600ms after attempt 2.
        assert!(started.elapsed() >= Duration::from_millis(900));

        let events = h.broker.records(&created.events_topic).await;
        let received: Vec<_> = events
            .iter()
            .filter(|e| e["type"] == "worker.received")
            .map(|e| e["attempt"].as_u64().unwrap())
            .collect();
        assert_eq!(received, vec![1, 2, 3]);

        let scheduled: Vec<_> = events
            .iter()
            .filter(|e| e["type"] == "run.retry_scheduled")
            .map(|e| e["attempt"].as_u64().unwrap())
            .collect();
        assert_eq!(scheduled, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_with_cleared_failure_succeeds() {
        let mut h = harness();
        let created = h.producer.create("demo", json!({}), Some(Step::Transform)).await.unwrap();
        h.worker.run_until_idle().await.unwrap();

        let replayed = h
            .producer
            .replay(&created.run_id, FailAtOverride::from_explicit(Some(None)))
            .await
            .unwrap();
        assert_eq!(replayed.seq, 1);
        assert_eq!(replayed.fail_at, None);

        assert_eq!(h.worker.run_until_idle().await.unwrap(), 1);

        let commands = h.broker.records(COMMANDS_TOPIC).await;
        assert_eq!(commands[1]["replay_seq"], 1);
        assert_eq!(commands[1]["fail_at"], JsonValue::Null);

        let types = event_types(&h.broker, &created.run_id).await;
        assert_eq!(types.last().map(String::as_str), Some("run.succeeded"));
        assert_eq!(count(&types, "run.replay_requested"), 1);

        let events = h.broker.records(&created.events_topic).await;
        let last_received = events.iter().rev().find(|e| e["type"] == "worker.received").unwrap();
        assert_eq!(last_received["attempt"], 1);
        assert_eq!(last_received["replay_seq"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_gets_a_fresh_attempt_budget() {
        let mut h = harness();
        let created = h.producer.create("demo", json!({}), Some(Step::Finalize)).await.unwrap();
        h.worker.run_until_idle().await.unwrap();

        h.producer.replay(&created.run_id, FailAtOverride::Inherit).await.unwrap();
        assert_eq!(h.worker.run_until_idle().await.unwrap(), 3);

        let dead = h.broker.records(DLQ_TOPIC).await;
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[1]["replay_seq"], 1);
        assert_eq!(dead[1]["attempts"], 3);

        let events = h.broker.records(&created.events_topic).await;
        let gen1: Vec<_> = events
            .iter()
            .filter(|e| e["type"] == "run.attempt_failed" && e["replay_seq"] == 1)
            .map(|e| e["attempt"].as_u64().unwrap())
            .collect();
        assert_eq!(gen1, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_connected_then_dlq_hint() {
        let mut h = harness();
        let created = h.producer.create("demo", json!({}), Some(Step::Transform)).await.unwrap();
        h.worker.run_until_idle().await.unwrap();
        assert_eq!(h.indexer.run_until_idle().await.unwrap(), 1);
        assert!(h.dlq.get(&created.run_id).await.is_some());

        let mut stream = h.broadcaster.subscribe(created.run_id.clone(), "observer-1");
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();

        assert_eq!(first, StreamItem::Connected { run_id: created.run_id.clone() });
        match second {
            StreamItem::DlqAvailable(record) => {
                assert_eq!(record.run_id, created.run_id);
                assert_eq!(record.attempts, 3);
            }
            other => panic!("expected dlq hint, got {other:?}"),
        }

        // Then the recorded timeline follows, starting at run.created.
        match stream.next().await.unwrap() {
            StreamItem::Event(value) => assert_eq!(value["type"], "run.created"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_productions_are_absorbed() {
        let mut h = harness();
        h.broker.ensure_topic(COMMANDS_TOPIC).await.unwrap();
        let command = RunCommand::new("dup".parse().unwrap(), "demo", json!({}), None, 0);
        for _ in 0..2 {
            h.broker
                .produce(COMMANDS_TOPIC, &command.to_value(), Some(&command.idempotency_key()))
                .await
                .unwrap();
        }

        assert_eq!(h.worker.run_until_idle().await.unwrap(), 1);
        let types = event_types(&h.broker, &command.run_id).await;
        assert_eq!(count(&types, "worker.received"), 1);
        assert_eq!(count(&types, "run.succeeded"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_nack_falls_back_to_ack_and_reports_it() {
        let mut h = flaky_harness(true, 0);
        let created = h.producer.create("demo", json!({}), Some(Step::Transform)).await.unwrap();

        assert_eq!(h.worker.run_until_idle().await.unwrap(), 1);

        assert_eq!(h.broker.ack_count().await, 1);
        assert_eq!(h.broker.nack_count().await, 0);
        assert!(h.worker.attempts().is_empty());
        assert!(h.broker.records(DLQ_TOPIC).await.is_empty());

        let events = h.broker.records(&created.events_topic).await;
        let last = events.last().unwrap();
        assert_eq!(last["type"], "run.failed");
        assert_eq!(last["reason"], "redelivery_unavailable");
        assert_eq!(h.worker.stats().runs_abandoned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dead_letter_publish_is_retried_with_the_same_key() {
        let mut h = flaky_harness(false, 1);
        let created = h.producer.create("demo", json!({}), Some(Step::Transform)).await.unwrap();

        // Three attempts plus one redelivery to finish dead-lettering.
        assert_eq!(h.worker.run_until_idle().await.unwrap(), 4);

        let dead = h.broker.records(DLQ_TOPIC).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0]["attempts"], 3);

        let types = event_types(&h.broker, &created.run_id).await;
        assert_eq!(count(&types, "worker.received"), 3);
        assert_eq!(count(&types, "run.dlq"), 1);
        assert_eq!(h.worker.stats().dead_letters_deferred, 1);
        assert!(h.worker.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_run_lookups_are_not_found() {
        let h = harness();
        let ghost: RunId = "ghost".parse().unwrap();
        assert!(h.producer.lookup(&ghost).await.is_err());
        assert!(h.dlq.lookup(&ghost).await.is_err());
    }
}
