//! Event broadcaster: fans a run's event channel out to live observers.
//!
//! Each observer is its own consumer group (`sse:<run>:<observer>`), so
//! observers never see each other's acks and a slow observer only slows
//! itself. Per subscription the observer receives, in order:
//!
//! 1. a `sse.connected` marker
//! 2. a `dlq.available` hint when the run is already in the dead-letter cache
//! 3. every event on `runs.events.<run>`, in arrival order
//!
//! interleaved with keep-alives whenever the channel stays quiet.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use runrelay_core::RunId;
use runrelay_events::{DeadLetterRecord, events_topic};

use crate::broker::{Broker, ConsumeOptions, safe_ack, safe_nack};
use crate::dlq::DlqCache;

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Quiet period after which a keep-alive is sent
    pub keep_alive: Duration,
    /// Lease of each delivered event
    pub lease: Duration,
    /// Per-observer buffer between the forwarder and the transport
    pub buffer: usize,
    /// Pause before re-opening after a broker error
    pub reconnect_delay: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(15),
            lease: Duration::from_millis(30_000),
            buffer: 64,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl BroadcasterConfig {
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

/// One item delivered to an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Connected { run_id: RunId },
    DlqAvailable(DeadLetterRecord),
    Event(JsonValue),
    KeepAlive,
}

impl StreamItem {
    /// JSON payload of the item; keep-alives carry none.
    pub fn to_json(&self) -> Option<JsonValue> {
        match self {
            StreamItem::Connected { run_id } => Some(json!({ "type": "sse.connected", "run_id": run_id })),
            StreamItem::DlqAvailable(record) => Some(json!({
                "type": "dlq.available",
                "run_id": record.run_id,
                "dlq": record.to_value(),
            })),
            StreamItem::Event(value) => Some(value.clone()),
            StreamItem::KeepAlive => None,
        }
    }
}

/// Consumer group of one observer of one run.
pub fn observer_group(run_id: &RunId, observer: &str) -> String {
    format!("sse:{run_id}:{observer}")
}

#[derive(Clone)]
pub struct EventBroadcaster {
    broker: Arc<dyn Broker>,
    dlq: DlqCache,
    config: BroadcasterConfig,
    cancel: CancellationToken,
}

impl EventBroadcaster {
    pub fn new(broker: Arc<dyn Broker>, dlq: DlqCache, config: BroadcasterConfig) -> Self {
        Self {
            broker,
            dlq,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop every subscription when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start forwarding `run_id`'s events to a new observer.
    ///
    /// The forwarder runs until the returned stream is dropped or the
    /// broadcaster is cancelled.
    pub fn subscribe(&self, run_id: RunId, observer: &str) -> ReceiverStream<StreamItem> {
        self.open(run_id, observer).0
    }

    fn open(&self, run_id: RunId, observer: &str) -> (ReceiverStream<StreamItem>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let group = observer_group(&run_id, observer);
        let forwarder = Forwarder {
            broker: self.broker.clone(),
            dlq: self.dlq.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            run_id,
            group,
            tx,
        };
        let task = tokio::spawn(forwarder.run());
        (ReceiverStream::new(rx), task)
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Forwarder {
    broker: Arc<dyn Broker>,
    dlq: DlqCache,
    config: BroadcasterConfig,
    cancel: CancellationToken,
    run_id: RunId,
    group: String,
    tx: mpsc::Sender<StreamItem>,
}

impl Forwarder {
    async fn send(&self, item: StreamItem) -> bool {
        self.tx.send(item).await.is_ok()
    }

    async fn run(self) {
        let topic = events_topic(&self.run_id);
        debug!(run_id = %self.run_id, group = %self.group, "observer connected");

        if !self.send(StreamItem::Connected { run_id: self.run_id.clone() }).await {
            return;
        }
        if let Some(record) = self.dlq.get(&self.run_id).await {
            if !self.send(StreamItem::DlqAvailable(record)).await {
                return;
            }
        }

        if let Err(e) = self.broker.ensure_topic(&topic).await {
            warn!(run_id = %self.run_id, error = %e, "could not ensure events topic");
        }

        let options = ConsumeOptions::default()
            .with_lease(self.config.lease)
            .with_idle_timeout(self.config.keep_alive);

        'reopen: loop {
            let mut stream = self.broker.consume_stream(&topic, &self.group, options.clone());

            loop {
                // A departed observer wins over a pending message, so nothing
                // is taken from the group on its behalf.
                let next = tokio::select! {
                    biased;
                    _ = self.tx.closed() => break 'reopen,
                    _ = self.cancel.cancelled() => break 'reopen,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(message)) => {
                        let Some(value) = message.extract_value() else {
                            debug!(run_id = %self.run_id, offset = message.offset, "skipping empty event");
                            safe_ack(self.broker.as_ref(), &topic, &self.group, &message).await;
                            continue;
                        };
                        if !self.send(StreamItem::Event(value)).await {
                            // Left mid-delivery: release the lease for the next connection.
                            safe_nack(self.broker.as_ref(), &topic, &self.group, &message).await;
                            break 'reopen;
                        }
                        safe_ack(self.broker.as_ref(), &topic, &self.group, &message).await;
                    }
                    Some(Err(e)) => {
                        warn!(run_id = %self.run_id, group = %self.group, error = %e, "event consume failed");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                            _ = self.tx.closed() => break 'reopen,
                            _ = self.cancel.cancelled() => break 'reopen,
                        }
                        continue 'reopen;
                    }
                    None => {
                        // Idle for a full keep-alive period.
                        if !self.send(StreamItem::KeepAlive).await {
                            break 'reopen;
                        }
                        continue 'reopen;
                    }
                }
            }
        }

        debug!(run_id = %self.run_id, group = %self.group, "observer disconnected");
    }
}
