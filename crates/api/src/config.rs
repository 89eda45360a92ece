//! Environment-driven process configuration.
//!
//! Every knob has a typed default; unset or unparseable variables fall back
//! to it (with a warning for the unparseable case).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use runrelay_infra::broker::HttpBrokerConfig;
use runrelay_infra::broker::http::BASE_URL_ENV_VARS;
use runrelay_infra::{BroadcasterConfig, DlqIndexerConfig, RetryPolicy, WorkerConfig};

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    /// Broker base URL; `None` selects the in-memory broker.
    pub broker_url: Option<String>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub step_delay: Duration,
    pub lease: Duration,
    pub idle_timeout: Duration,
    pub keep_alive: Duration,
    /// Items buffered per observer before its forwarder waits.
    pub observer_buffer: usize,
    /// Timeout of broker control calls (health, topics, ack, nack).
    pub broker_timeout: Duration,
    pub produce_timeout: Duration,
    pub dlq_cache_capacity: usize,
    pub cors_origin: String,
    pub worker_group: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            broker_url: None,
            max_attempts: 3,
            backoff_base: Duration::from_millis(300),
            step_delay: Duration::from_millis(200),
            lease: Duration::from_millis(30_000),
            idle_timeout: Duration::from_millis(60_000),
            keep_alive: Duration::from_secs(15),
            observer_buffer: 64,
            broker_timeout: Duration::from_secs(5),
            produce_timeout: Duration::from_secs(10),
            dlq_cache_capacity: 1000,
            cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
            worker_group: "demo-worker".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let broker_url = BASE_URL_ENV_VARS
            .iter()
            .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()));

        Self {
            bind: parse_or(&lookup, "RUNRELAY_BIND", defaults.bind),
            broker_url,
            max_attempts: parse_or(&lookup, "RUNRELAY_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            backoff_base: millis_or(&lookup, "RUNRELAY_BACKOFF_BASE_MS", defaults.backoff_base),
            step_delay: millis_or(&lookup, "RUNRELAY_STEP_DELAY_MS", defaults.step_delay),
            lease: millis_or(&lookup, "RUNRELAY_LEASE_MS", defaults.lease),
            idle_timeout: millis_or(&lookup, "RUNRELAY_IDLE_TIMEOUT_MS", defaults.idle_timeout),
            keep_alive: Duration::from_secs(
                parse_or(&lookup, "RUNRELAY_KEEPALIVE_SECS", defaults.keep_alive.as_secs()).max(1),
            ),
            observer_buffer: parse_or(&lookup, "RUNRELAY_SSE_BUFFER", defaults.observer_buffer).max(1),
            broker_timeout: millis_or(&lookup, "RUNRELAY_BROKER_TIMEOUT_MS", defaults.broker_timeout),
            produce_timeout: millis_or(&lookup, "RUNRELAY_PRODUCE_TIMEOUT_MS", defaults.produce_timeout),
            dlq_cache_capacity: parse_or(&lookup, "RUNRELAY_DLQ_CACHE_CAPACITY", defaults.dlq_cache_capacity),
            cors_origin: lookup("RUNRELAY_CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            worker_group: lookup("RUNRELAY_WORKER_GROUP")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.worker_group),
        }
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = Some(url.into());
        self
    }

    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn http_broker(&self) -> Option<HttpBrokerConfig> {
        self.broker_url
            .as_deref()
            .map(|url| {
                HttpBrokerConfig::default()
                    .with_base_url(url)
                    .with_control_timeout(self.broker_timeout)
                    .with_produce_timeout(self.produce_timeout)
            })
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_group(self.worker_group.clone())
            .with_policy(RetryPolicy::linear(self.max_attempts, self.backoff_base))
            .with_lease(self.lease)
            .with_idle_timeout(self.idle_timeout)
    }

    pub fn dlq_indexer(&self) -> DlqIndexerConfig {
        DlqIndexerConfig::default()
            .with_lease(self.lease)
            .with_idle_timeout(self.idle_timeout)
    }

    pub fn broadcaster(&self) -> BroadcasterConfig {
        BroadcasterConfig::default()
            .with_keep_alive(self.keep_alive)
            .with_buffer(self.observer_buffer)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_or(lookup, name, default.as_millis() as u64))
}
