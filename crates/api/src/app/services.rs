use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runrelay_events::{COMMANDS_TOPIC, DLQ_TOPIC};
use runrelay_infra::{
    Broker, BrokerError, CommandProducer, DlqCache, DlqIndexer, EventBroadcaster, EventEmitter, HttpBroker,
    InMemoryBroker, RunRegistry, Worker, WorkerStats, WorkflowExecutor,
};

use crate::config::AppConfig;

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppServices {
    broker: Arc<dyn Broker>,
    producer: CommandProducer,
    dlq: DlqCache,
    broadcaster: EventBroadcaster,
    config: AppConfig,
    cancel: CancellationToken,
}

/// Handles of the worker and the DLQ indexer.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    worker: JoinHandle<WorkerStats>,
    indexer: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Cancel both loops and wait for them to settle.
    pub async fn shutdown(self) -> Option<WorkerStats> {
        self.cancel.cancel();
        if let Err(e) = self.indexer.await {
            warn!(error = %e, "dlq indexer task ended abnormally");
        }
        match self.worker.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "worker task ended abnormally");
                None
            }
        }
    }
}

/// Build services for `config`: the HTTP broker when a URL is configured,
/// the in-memory broker otherwise.
pub fn build_services(config: AppConfig) -> Result<AppServices, BrokerError> {
    let broker: Arc<dyn Broker> = match config.http_broker() {
        Some(http) => {
            info!(base_url = %http.base_url, "using http broker");
            Arc::new(HttpBroker::new(http)?)
        }
        None => {
            info!("no broker url configured; using in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
    };
    Ok(AppServices::with_broker(broker, config))
}

impl AppServices {
    pub fn with_broker(broker: Arc<dyn Broker>, config: AppConfig) -> Self {
        let cancel = CancellationToken::new();
        let emitter = EventEmitter::new(broker.clone());
        let producer = CommandProducer::new(RunRegistry::new(), emitter);
        let dlq = DlqCache::new(config.dlq_cache_capacity);
        let broadcaster = EventBroadcaster::new(broker.clone(), dlq.clone(), config.broadcaster())
            .with_cancellation(cancel.child_token());

        Self {
            broker,
            producer,
            dlq,
            broadcaster,
            config,
            cancel,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn producer(&self) -> &CommandProducer {
        &self.producer
    }

    pub fn dlq(&self) -> &DlqCache {
        &self.dlq
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Token that ends the background loops and every observer stream.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Create the shared channels up front. Failures are logged only; the
    /// worker and the producer ensure them again on use.
    pub async fn prepare_topics(&self) {
        for topic in [COMMANDS_TOPIC, DLQ_TOPIC] {
            if let Err(e) = self.broker.ensure_topic(topic).await {
                warn!(topic, error = %e, "could not ensure topic at startup");
            }
        }
    }

    /// Spawn the worker loop and the DLQ indexer.
    ///
    /// Shutting the returned tasks down also ends every live observer stream.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let emitter = EventEmitter::new(self.broker.clone());
        let executor = WorkflowExecutor::simulated(emitter.clone(), self.config.step_delay);
        let worker = Worker::new(emitter, executor, self.config.worker());
        let indexer = DlqIndexer::new(self.broker.clone(), self.dlq.clone(), self.config.dlq_indexer());

        BackgroundTasks {
            cancel: self.cancel.clone(),
            worker: tokio::spawn(worker.run(self.cancel.child_token())),
            indexer: tokio::spawn(indexer.run(self.cancel.child_token())),
        }
    }
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
