use axum::{routing::get, Router};

pub mod event_stream;
pub mod runs;
pub mod system;

/// Router for every endpoint of the service.
pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(system::healthz))
        .nest("/runs", runs::router().merge(event_stream::router()))
}
