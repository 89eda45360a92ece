use std::sync::Arc;

use anyhow::Context;
use runrelay_api::{app, AppConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runrelay_observability::init();

    let config = AppConfig::from_env();
    let bind = config.bind;

    let services = Arc::new(app::build_services(config).context("failed to build broker client")?);
    services.prepare_topics().await;
    let background = services.spawn_background();
    let cancel = services.cancellation();

    let router = app::build_app(services);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("http server failed")?;

    if let Some(stats) = background.shutdown().await {
        tracing::info!(?stats, "background tasks stopped");
    }
    Ok(())
}

/// Resolve on Ctrl-C, closing live event streams so in-flight connections drain.
async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}
