//! HTTP API application wiring (Axum router + service wiring).
//!
//! Layout:
//! - `services.rs`: broker selection, producer/cache/broadcaster wiring, background tasks
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and body parsing
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    Extension, Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, BackgroundTasks, build_services};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let cors = cors_layer(&services.config().cors_origin);

    routes::router().layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(Extension(services)),
    )
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .allow_credentials(true);

    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(value),
        Err(_) => {
            warn!(origin, "invalid CORS origin; cross-origin requests disabled");
            layer
        }
    }
}
