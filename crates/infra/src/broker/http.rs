//! DriftQ-style HTTP broker gateway.
//!
//! Routes (all under the `/v1` base):
//!
//! - `GET /healthz`
//! - `POST /topics` with `{"name", "partitions"}`
//! - `POST /produce` with `{"topic", "value": "<json string>", "envelope": {...}}`
//! - `GET /consume?topic&group&owner&lease_ms` streaming NDJSON
//! - `POST /ack`, `POST /nack` with `{"topic", "group", "owner", "partition", "offset"}`

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use super::{Broker, BrokerError, ConsumeOptions, Envelope, LeasedMessage, MessageStream};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/v1";

/// Environment variables consulted for the base URL, in priority order.
pub const BASE_URL_ENV_VARS: [&str; 3] = ["DRIFTQ_HTTP_URL", "DRIFTQ_URL", "DRIFTQ_BASE_URL"];

/// Normalise a broker base URL: trim, strip trailing `/`, ensure a `/v1` suffix.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_BASE_URL.to_string();
    }
    if trimmed.ends_with("/v1") {
        return trimmed.to_string();
    }
    format!("{trimmed}/v1")
}

/// HTTP broker configuration.
#[derive(Debug, Clone)]
pub struct HttpBrokerConfig {
    /// Normalised base URL (ends in `/v1`).
    pub base_url: String,

    /// Timeout for control calls (healthz, topics, ack, nack).
    pub control_timeout: Duration,

    /// Timeout for produce calls.
    pub produce_timeout: Duration,

    /// Partition count used when creating topics.
    pub partitions: u32,
}

impl Default for HttpBrokerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            control_timeout: Duration::from_secs(5),
            produce_timeout: Duration::from_secs(10),
            partitions: 1,
        }
    }
}

impl HttpBrokerConfig {
    pub fn with_base_url(mut self, raw: &str) -> Self {
        self.base_url = normalize_base_url(raw);
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn with_produce_timeout(mut self, timeout: Duration) -> Self {
        self.produce_timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct CreateTopicBody<'a> {
    name: &'a str,
    partitions: u32,
}

#[derive(Debug, Serialize)]
struct ProduceBody<'a> {
    topic: &'a str,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    envelope: Option<Envelope>,
}

#[derive(Debug, Serialize)]
struct SettleBody<'a> {
    topic: &'a str,
    group: &'a str,
    owner: &'a str,
    partition: u32,
    offset: u64,
}

/// HTTP broker gateway.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: Client,
    config: HttpBrokerConfig,
}

impl HttpBroker {
    pub fn new(config: HttpBrokerConfig) -> Result<Self, BrokerError> {
        // No client-wide timeout: consume responses are long-lived streams.
        let client = Client::builder().build()?;
        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path)
    }

    async fn settle(&self, route: &str, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError> {
        let body = SettleBody {
            topic,
            group,
            owner: &message.owner,
            partition: message.partition,
            offset: message.offset,
        };
        let response = self
            .client
            .post(self.url(route))
            .timeout(self.config.control_timeout)
            .json(&body)
            .send()
            .await?;

        expect_status(response, &[StatusCode::OK, StatusCode::NO_CONTENT]).await
    }
}

async fn expect_status(response: reqwest::Response, accepted: &[StatusCode]) -> Result<(), BrokerError> {
    let status = response.status();
    if accepted.contains(&status) {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(BrokerError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Encode a produce value the way the broker expects: strings verbatim,
/// everything else as compact JSON text.
fn encode_value(value: &JsonValue) -> Result<String, BrokerError> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        other => serde_json::to_string(other).map_err(|e| BrokerError::Serialization(e.to_string())),
    }
}

/// Parse one NDJSON line into a message, injecting the lease owner.
///
/// Blank lines, unparseable lines and non-object lines yield `None`.
fn parse_line(line: &[u8], owner: &str) -> Option<LeasedMessage> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let raw: JsonValue = match serde_json::from_str(text) {
        Ok(value @ JsonValue::Object(_)) => value,
        Ok(_) => return None,
        Err(e) => {
            debug!(error = %e, "skipping unparseable consume line");
            return None;
        }
    };
    let mut message: LeasedMessage = serde_json::from_value(raw).ok()?;
    message.owner = owner.to_string();
    Some(message)
}

type ByteStream = stream::BoxStream<'static, Result<Bytes, reqwest::Error>>;

struct NdjsonState {
    body: Option<ByteStream>,
    buffer: Vec<u8>,
    owner: String,
    idle_timeout: Duration,
}

impl NdjsonState {
    /// Next complete message, reading more chunks as needed.
    async fn next_message(&mut self) -> Option<Result<LeasedMessage, BrokerError>> {
        loop {
            while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                if let Some(message) = parse_line(&line, &self.owner) {
                    return Some(Ok(message));
                }
            }

            let body = self.body.as_mut()?;
            match tokio::time::timeout(self.idle_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => self.buffer.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => {
                    self.body = None;
                    return Some(Err(e.into()));
                }
                Ok(None) | Err(_) => {
                    // End of body or idle: flush any trailing line, then stop.
                    self.body = None;
                    let rest = std::mem::take(&mut self.buffer);
                    return parse_line(&rest, &self.owner).map(Ok);
                }
            }
        }
    }
}

#[async_trait]
impl Broker for HttpBroker {
    #[instrument(skip(self), err)]
    async fn healthz(&self) -> Result<JsonValue, BrokerError> {
        let response = self
            .client
            .get(self.url("healthz"))
            .timeout(self.config.control_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<JsonValue>().await?)
    }

    #[instrument(skip(self), err)]
    async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let body = CreateTopicBody {
            name: topic,
            partitions: self.config.partitions,
        };
        let response = self
            .client
            .post(self.url("topics"))
            .timeout(self.config.control_timeout)
            .json(&body)
            .send()
            .await?;

        expect_status(
            response,
            &[StatusCode::OK, StatusCode::CREATED, StatusCode::NO_CONTENT, StatusCode::CONFLICT],
        )
        .await
    }

    #[instrument(skip(self, value), err)]
    async fn produce(
        &self,
        topic: &str,
        value: &JsonValue,
        idempotency_key: Option<&str>,
    ) -> Result<(), BrokerError> {
        let envelope = Envelope {
            tenant_id: None,
            idempotency_key: idempotency_key.map(str::to_string),
        };
        let body = ProduceBody {
            topic,
            value: encode_value(value)?,
            envelope: (!envelope.is_empty()).then_some(envelope),
        };
        let response = self
            .client
            .post(self.url("produce"))
            .timeout(self.config.produce_timeout)
            .json(&body)
            .send()
            .await?;

        expect_status(
            response,
            &[StatusCode::OK, StatusCode::CREATED, StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
        )
        .await
    }

    fn consume_stream(&self, topic: &str, group: &str, options: ConsumeOptions) -> MessageStream {
        let owner = options.effective_owner(group);
        let request = self.client.get(self.url("consume")).query(&[
            ("topic", topic.to_string()),
            ("group", group.to_string()),
            ("owner", owner.clone()),
            ("lease_ms", options.lease.as_millis().to_string()),
        ]);
        let idle_timeout = options.idle_timeout;

        let opened = async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => return stream::iter(vec![Err::<LeasedMessage, _>(BrokerError::from(e))]).boxed(),
            };
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), "consume request rejected");
                return stream::iter(vec![Err::<LeasedMessage, _>(BrokerError::Status {
                    status: status.as_u16(),
                    body,
                })])
                .boxed();
            }

            let state = NdjsonState {
                body: Some(response.bytes_stream().boxed()),
                buffer: Vec::new(),
                owner,
                idle_timeout,
            };
            stream::unfold(state, |mut state| async move {
                let item = state.next_message().await?;
                Some((item, state))
            })
            .boxed()
        };

        Box::pin(stream::once(opened).flatten())
    }

    #[instrument(skip(self, message), fields(offset = message.offset), err)]
    async fn ack(&self, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError> {
        self.settle("ack", topic, group, message).await
    }

    #[instrument(skip(self, message), fields(offset = message.offset), err)]
    async fn nack(&self, topic: &str, group: &str, message: &LeasedMessage) -> Result<(), BrokerError> {
        self.settle("nack", topic, group, message).await
    }
}
