//! Broker Gateway: the only code that talks to the external queue.
//!
//! The gateway contract is deliberately narrow:
//!
//! - `ensure_topic`: idempotent create-if-absent ("already exists" is success)
//! - `produce`: at-least-once publish; a repeated idempotency key is a no-op downstream
//! - `consume_stream`: lazy, consumer-group scoped stream of leased messages that ends
//!   once nothing arrives for `idle_timeout` (re-invoke to keep consuming)
//! - `ack` / `nack`: settle a leased message; both are best-effort for callers
//!
//! Two implementations live here:
//!
//! - [`HttpBroker`]: DriftQ-style HTTP gateway (`/v1/topics`, `/v1/produce`, NDJSON `/v1/consume`, ...)
//! - [`InMemoryBroker`]: in-process broker for dev/test with the same delivery semantics

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

pub mod http;
pub mod in_memory;

pub use http::{HttpBroker, HttpBrokerConfig};
pub use in_memory::InMemoryBroker;

/// Broker gateway error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Transport failure (connection refused, timeout, ...).
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker answered with an unexpected status.
    #[error("broker returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Ack/nack for a message the group does not currently hold a lease on.
    #[error("message {topic}@{partition}:{offset} is not leased")]
    NotLeased {
        topic: String,
        partition: u32,
        offset: u64,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(value: reqwest::Error) -> Self {
        BrokerError::Unavailable(value.to_string())
    }
}

/// Broker metadata attached to a produced record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Envelope {
    pub fn is_empty(&self) -> bool {
        self.tenant_id.is_none() && self.idempotency_key.is_none()
    }
}

/// A message delivered under a lease.
///
/// `owner`, `partition` and `offset` identify the lease for `ack`/`nack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedMessage {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub partition: u32,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub envelope: Option<Envelope>,
    #[serde(default)]
    pub value: JsonValue,
}

impl LeasedMessage {
    /// Extract the application payload.
    ///
    /// Producers publish JSON objects encoded into a string value, so:
    /// - objects are returned as-is
    /// - strings that look like JSON objects/arrays are decoded (non-objects are
    ///   wrapped as `{"value": ...}`, undecodable text as `{"value": <raw>}`)
    /// - any other string is wrapped as `{"value": <raw>}`
    /// - anything else (absent, numbers, ...) yields `None`
    pub fn extract_value(&self) -> Option<JsonValue> {
        match &self.value {
            JsonValue::Object(_) => Some(self.value.clone()),
            JsonValue::String(raw) => {
                let trimmed = raw.trim();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    match serde_json::from_str::<JsonValue>(trimmed) {
                        Ok(decoded @ JsonValue::Object(_)) => Some(decoded),
                        Ok(decoded) => Some(wrap(decoded)),
                        Err(_) => Some(wrap(JsonValue::String(raw.clone()))),
                    }
                } else {
                    Some(wrap(JsonValue::String(raw.clone())))
                }
            }
            _ => None,
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.envelope
            .as_ref()
            .and_then(|e| e.idempotency_key.as_deref())
    }
}

fn wrap(value: JsonValue) -> JsonValue {
    serde_json::json!({ "value": value })
}

/// Options for one `consume_stream` invocation.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Lease owner; defaults to the group name.
    pub owner: Option<String>,
    /// How long a delivered message stays leased before it becomes redeliverable.
    pub lease: Duration,
    /// The stream ends once nothing has been delivered for this long.
    pub idle_timeout: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            owner: None,
            lease: Duration::from_millis(30_000),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl ConsumeOptions {
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
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

    pub(crate) fn effective_owner(&self, group: &str) -> String {
        match &self.owner {
            Some(owner) if !owner.is_empty() => owner.clone(),
            _ if !group.is_empty() => group.to_string(),
            _ => format!("owner-{}", &uuid::Uuid::now_v7().simple().to_string()[..8]),
        }
    }
}

/// Lazy sequence of leased messages.
pub type MessageStream = BoxStream<'static, Result<LeasedMessage, BrokerError>>;

/// Narrow broker interface consumed by the orchestration engine.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Broker health document.
    async fn healthz(&self) -> Result<JsonValue, BrokerError>;

    /// Create the topic if absent. Must treat "already exists" as success.
    async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Publish `value`. A repeated `idempotency_key` must not yield a second
    /// logical record.
    async fn produce(
        &self,
        topic: &str,
        value: &JsonValue,
        idempotency_key: Option<&str>,
    ) -> Result<(), BrokerError>;

    /// Consume `topic` as consumer group `group`.
    fn consume_stream(&self, topic: &str, group: &str, options: ConsumeOptions) -> MessageStream;

    /// Settle a leased message (no further redelivery).
    async fn ack(&self, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError>;

    /// Release a leased message for redelivery.
    async fn nack(&self, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError>;
}

/// Acknowledge, logging and swallowing any failure.
///
/// A failed ack must never cascade into losing track of run state: the
/// caller's own bookkeeping is authoritative, not the broker's lease.
pub async fn safe_ack(broker: &dyn Broker, topic: &str, group: &str, message: &LeasedMessage) -> bool {
    match broker.ack(topic, group, message).await {
        Ok(()) => true,
        Err(e) => {
            warn!(topic, group, offset = message.offset, error = %e, "ack failed");
            false
        }
    }
}

/// Request redelivery, logging and swallowing any failure.
///
/// Returns whether the broker accepted the request.
pub async fn safe_nack(broker: &dyn Broker, topic: &str, group: &str, message: &LeasedMessage) -> bool {
    match broker.nack(topic, group, message).await {
        Ok(()) => true,
        Err(e) => {
            warn!(topic, group, offset = message.offset, error = %e, "nack failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(value: JsonValue) -> LeasedMessage {
        LeasedMessage {
            topic: "t".into(),
            partition: 0,
            offset: 0,
            owner: "o".into(),
            envelope: None,
            value,
        }
    }

    #[test]
    fn extract_value_passes_objects_through() {
        let v = json!({"run_id": "r1"});
        assert_eq!(msg(v.clone()).extract_value(), Some(v));
    }

    #[test]
    fn extract_value_decodes_json_strings() {
        let m = msg(json!("{\"run_id\":\"r1\",\"replay_seq\":2}"));
        assert_eq!(m.extract_value(), Some(json!({"run_id": "r1", "replay_seq": 2})));
    }

    #[test]
    fn extract_value_wraps_non_objects() {
        assert_eq!(msg(json!("[1,2]")).extract_value(), Some(json!({"value": [1, 2]})));
        assert_eq!(msg(json!("plain")).extract_value(), Some(json!({"value": "plain"})));
        assert_eq!(msg(json!("{broken")).extract_value(), Some(json!({"value": "{broken"})));
        assert_eq!(msg(JsonValue::Null).extract_value(), None);
        assert_eq!(msg(json!(5)).extract_value(), None);
    }

    #[test]
    fn wire_message_decodes_with_envelope() {
        let raw = json!({
            "topic": "runs.commands",
            "partition": 0,
            "offset": 12,
            "envelope": {"idempotency_key": "cmd:r1:0"},
            "value": "{\"run_id\":\"r1\"}"
        });
        let m: LeasedMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(m.offset, 12);
        assert_eq!(m.idempotency_key(), Some("cmd:r1:0"));
        assert_eq!(m.owner, "");
    }

    #[test]
    fn owner_defaults_to_group() {
        let opts = ConsumeOptions::default();
        assert_eq!(opts.effective_owner("demo-worker"), "demo-worker");
        assert_eq!(opts.clone().with_owner("w1").effective_owner("g"), "w1");
        assert!(opts.effective_owner("").starts_with("owner-"));
    }
}
