//! DLQ indexer: mirrors `runs.dlq` into the recency cache.
//!
//! Runs in its own consumer group so indexing never competes with the
//! worker's dead-lettering. Every delivered record is acked, indexed or not.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use runrelay_events::{DLQ_TOPIC, DeadLetterRecord};

use crate::broker::{Broker, BrokerError, ConsumeOptions, LeasedMessage, safe_ack};

use super::cache::DlqCache;

/// Indexer configuration.
#[derive(Debug, Clone)]
pub struct DlqIndexerConfig {
    pub group: String,
    pub lease: Duration,
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for DlqIndexerConfig {
    fn default() -> Self {
        Self {
            group: "dlq-indexer".to_string(),
            lease: Duration::from_millis(30_000),
            idle_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl DlqIndexerConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

pub struct DlqIndexer {
    broker: Arc<dyn Broker>,
    cache: DlqCache,
    config: DlqIndexerConfig,
    cancel: CancellationToken,
}

impl DlqIndexer {
    pub fn new(broker: Arc<dyn Broker>, cache: DlqCache, config: DlqIndexerConfig) -> Self {
        Self {
            broker,
            cache,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cache(&self) -> &DlqCache {
        &self.cache
    }

    /// Index one delivered record. Returns whether it was cached.
    pub async fn handle(&self, message: &LeasedMessage) -> bool {
        let indexed = match message.extract_value().map(|p| DeadLetterRecord::from_payload(&p)) {
            Some(Ok(record)) => {
                let run_id = record.run_id.clone();
                let evicted = self.cache.insert(record).await;
                debug!(run_id = %run_id, evicted = evicted.len(), "dead letter indexed");
                true
            }
            Some(Err(e)) => {
                warn!(offset = message.offset, error = %e, "skipping malformed dead letter");
                false
            }
            None => {
                warn!(offset = message.offset, "skipping dead letter without payload");
                false
            }
        };

        safe_ack(self.broker.as_ref(), DLQ_TOPIC, &self.config.group, message).await;
        indexed
    }

    /// Consume until idle or cancelled; returns the number of records handled.
    pub async fn run_until_idle(&self) -> Result<u64, BrokerError> {
        let options = ConsumeOptions::default()
            .with_lease(self.config.lease)
            .with_idle_timeout(self.config.idle_timeout);
        let mut stream = self.broker.consume_stream(DLQ_TOPIC, &self.config.group, options);
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
    pub async fn run(mut self, cancel: CancellationToken) {
        self.cancel = cancel;
        info!(group = %self.config.group, topic = DLQ_TOPIC, "dlq indexer started");

        while !self.cancel.is_cancelled() {
            let result = match self.broker.ensure_topic(DLQ_TOPIC).await {
                Ok(()) => self.run_until_idle().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(error = %e, "dlq indexer consume failed");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        info!(group = %self.config.group, "dlq indexer stopped");
    }
}

impl std::fmt::Debug for DlqIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqIndexer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
