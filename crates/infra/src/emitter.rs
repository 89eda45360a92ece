//! Publishing onto per-run event channels.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::warn;

use runrelay_core::RunId;
use runrelay_events::{RunEvent, RunEventKind, events_topic};

use crate::broker::{Broker, BrokerError};

/// Emits run events, creating each run's channel on first use.
///
/// Topics already ensured by this emitter are remembered so steady-state
/// emission is a single produce call.
#[derive(Clone)]
pub struct EventEmitter {
    broker: Arc<dyn Broker>,
    ensured: Arc<Mutex<HashSet<String>>>,
}

impl EventEmitter {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            ensured: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    async fn ensure(&self, topic: &str) -> Result<(), BrokerError> {
        if self.ensured.lock().await.contains(topic) {
            return Ok(());
        }
        self.broker.ensure_topic(topic).await?;
        self.ensured.lock().await.insert(topic.to_string());
        Ok(())
    }

    /// Emit a typed event, optionally under an idempotency key.
    pub async fn emit(
        &self,
        run_id: &RunId,
        kind: RunEventKind,
        idempotency_key: Option<&str>,
    ) -> Result<RunEvent, BrokerError> {
        let event = RunEvent::new(run_id.clone(), kind);
        self.emit_value(run_id, &event.to_value(), idempotency_key).await?;
        Ok(event)
    }

    /// Emit an arbitrary JSON record onto the run's channel.
    pub async fn emit_value(
        &self,
        run_id: &RunId,
        value: &JsonValue,
        idempotency_key: Option<&str>,
    ) -> Result<(), BrokerError> {
        let topic = events_topic(run_id);
        self.ensure(&topic).await?;
        self.broker.produce(&topic, value, idempotency_key).await
    }

    /// Emit and swallow failures.
    ///
    /// Used where the command must be settled even when the event is lost,
    /// e.g. after the dead-letter record is already durable.
    pub async fn emit_or_log(&self, run_id: &RunId, kind: RunEventKind) -> bool {
        let type_name = kind.type_name();
        match self.emit(run_id, kind, None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(run_id = %run_id, event = type_name, error = %e, "event emission failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}
