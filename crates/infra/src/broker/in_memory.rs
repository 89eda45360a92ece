//! In-memory broker for tests/dev.
//!
//! Mirrors the delivery semantics of the HTTP broker closely enough that the
//! orchestration engine cannot tell the two apart:
//!
//! - topics must exist before produce (consume on an unknown topic just idles)
//! - duplicate idempotency keys are suppressed per topic
//! - consumer groups start at the earliest record and keep their own cursor
//! - delivered messages are leased; expired or nacked leases are redelivered
//! - a consume stream ends once nothing was delivered for `idle_timeout`

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use serde_json::{Value as JsonValue, json};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{Broker, BrokerError, ConsumeOptions, Envelope, LeasedMessage, MessageStream};

#[derive(Debug, Clone)]
struct StoredRecord {
    envelope: Option<Envelope>,
    value: JsonValue,
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: u64,
    redeliver: VecDeque<u64>,
    leased: HashMap<u64, Lease>,
}

impl GroupState {
    /// Move expired leases back into the redelivery queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(offset, _)| *offset)
            .collect();
        expired.sort_unstable();
        for offset in expired {
            self.leased.remove(&offset);
            self.redeliver.push_back(offset);
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.leased.values().map(|l| l.expires_at).min()
    }

    fn next_offset(&mut self, available: u64) -> Option<u64> {
        if let Some(offset) = self.redeliver.pop_front() {
            return Some(offset);
        }
        if self.cursor < available {
            let offset = self.cursor;
            self.cursor += 1;
            return Some(offset);
        }
        None
    }
}

#[derive(Debug, Default)]
struct TopicState {
    records: Vec<StoredRecord>,
    keys: HashSet<String>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, TopicState>,
    acks: u64,
    nacks: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// In-process broker.
///
/// Cloning is cheap and every clone shares the same topics.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded payloads currently stored on `topic`, in offset order.
    pub async fn records(&self, topic: &str) -> Vec<JsonValue> {
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|t| {
                t.records
                    .iter()
                    .filter_map(|r| to_message(topic, 0, "", r).extract_value())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn topics(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut names: Vec<String> = state.topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total successful acks across all topics and groups.
    pub async fn ack_count(&self) -> u64 {
        self.inner.state.lock().await.acks
    }

    /// Total successful nacks across all topics and groups.
    pub async fn nack_count(&self) -> u64 {
        self.inner.state.lock().await.nacks
    }

    /// Messages of `topic` currently leased to `group` and not yet settled.
    pub async fn leased_count(&self, topic: &str, group: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.leased.len())
    }

    async fn next_delivery(
        &self,
        topic: &str,
        group: &str,
        owner: &str,
        options: &ConsumeOptions,
    ) -> Option<LeasedMessage> {
        let idle_deadline = Instant::now() + options.idle_timeout;

        loop {
            // Registered before inspecting state so a produce/nack racing with
            // this check still wakes us.
            let notified = self.inner.notify.notified();

            let wake_at = {
                let mut state = self.inner.state.lock().await;
                let now = Instant::now();
                match state.topics.get_mut(topic) {
                    Some(topic_state) => {
                        let available = topic_state.records.len() as u64;
                        let group_state = topic_state.groups.entry(group.to_string()).or_default();
                        group_state.reclaim_expired(now);

                        if let Some(offset) = group_state.next_offset(available) {
                            group_state.leased.insert(
                                offset,
                                Lease {
                                    owner: owner.to_string(),
                                    expires_at: now + options.lease,
                                },
                            );
                            let record = &topic_state.records[offset as usize];
                            return Some(to_message(topic, offset, owner, record));
                        }

                        match group_state.next_expiry() {
                            Some(expiry) if expiry < idle_deadline => expiry,
                            _ => idle_deadline,
                        }
                    }
                    None => idle_deadline,
                }
            };

            if Instant::now() >= idle_deadline {
                return None;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            if Instant::now() >= idle_deadline {
                // One last look: something may have landed exactly at the deadline.
                let state = self.inner.state.lock().await;
                let pending = state.topics.get(topic).is_some_and(|t| {
                    t.groups.get(group).is_some_and(|g| {
                        !g.redeliver.is_empty() || g.cursor < t.records.len() as u64
                    })
                });
                if !pending {
                    return None;
                }
            }
        }
    }

    async fn settle(
        &self,
        topic: &str,
        group: &str,
        message: &LeasedMessage,
        redeliver: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        let not_leased = || BrokerError::NotLeased {
            topic: topic.to_string(),
            partition: message.partition,
            offset: message.offset,
        };

        let group_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?
            .groups
            .get_mut(group)
            .ok_or_else(not_leased)?;

        match group_state.leased.get(&message.offset) {
            Some(lease) if lease.owner == message.owner => {}
            _ => return Err(not_leased()),
        }
        group_state.leased.remove(&message.offset);

        if redeliver {
            group_state.redeliver.push_back(message.offset);
            state.nacks += 1;
            drop(state);
            self.inner.notify.notify_waiters();
        } else {
            state.acks += 1;
        }
        Ok(())
    }
}

fn to_message(topic: &str, offset: u64, owner: &str, record: &StoredRecord) -> LeasedMessage {
    LeasedMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        owner: owner.to_string(),
        envelope: record.envelope.clone(),
        value: record.value.clone(),
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn healthz(&self) -> Result<JsonValue, BrokerError> {
        let topics = self.inner.state.lock().await.topics.len();
        Ok(json!({ "ok": true, "mode": "in-memory", "topics": topics }))
    }

    async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        state.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn produce(
        &self,
        topic: &str,
        value: &JsonValue,
        idempotency_key: Option<&str>,
    ) -> Result<(), BrokerError> {
        // Stored the way the HTTP broker stores it: a JSON-encoded string.
        let encoded = match value {
            JsonValue::String(s) => JsonValue::String(s.clone()),
            other => JsonValue::String(
                serde_json::to_string(other).map_err(|e| BrokerError::Serialization(e.to_string()))?,
            ),
        };

        let mut state = self.inner.state.lock().await;
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

        if let Some(key) = idempotency_key {
            if !topic_state.keys.insert(key.to_string()) {
                debug!(topic, idempotency_key = key, "duplicate produce suppressed");
                return Ok(());
            }
        }

        topic_state.records.push(StoredRecord {
            envelope: idempotency_key.map(|key| Envelope {
                tenant_id: None,
                idempotency_key: Some(key.to_string()),
            }),
            value: encoded,
        });
        drop(state);

        self.inner.notify.notify_waiters();
        Ok(())
    }

    fn consume_stream(&self, topic: &str, group: &str, options: ConsumeOptions) -> MessageStream {
        let owner = options.effective_owner(group);
        let seed = (self.clone(), topic.to_string(), group.to_string(), owner, options);

        Box::pin(stream::unfold(seed, |(broker, topic, group, owner, options)| async move {
            let message = broker.next_delivery(&topic, &group, &owner, &options).await?;
            Some((Ok(message), (broker, topic, group, owner, options)))
        }))
    }

    async fn ack(&self, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError> {
        self.settle(topic, group, message, false).await
    }

    async fn nack(&self, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError> {
        self.settle(topic, group, message, true).await
    }
}
