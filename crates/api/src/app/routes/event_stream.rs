//! Live per-run event stream over Server-Sent Events.
//!
//! Each connection is an independent observer of one run: it receives a
//! `sse.connected` marker, a `dlq.available` hint when the run already
//! dead-lettered, then the run's events in order. Quiet periods are filled
//! with `: keep-alive` comments.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::{header, HeaderName},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse,
    },
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use runrelay_infra::StreamItem;

use crate::app::errors;
use crate::app::routes::runs::parse_run_id;
use crate::app::services::AppServices;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new().route("/:id/events", get(stream_run_events))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Observer identity; a fresh one is generated when absent.
    pub client_id: Option<String>,
}

/// GET /runs/:id/events?client_id=<observer>
pub async fn stream_run_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> axum::response::Response {
    let run_id = match parse_run_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !services.producer().registry().contains(&run_id).await {
        return errors::json_error(
            axum::http::StatusCode::NOT_FOUND,
            "not_found",
            format!("run not found: {run_id}"),
        );
    }

    let observer = observer_id(query.client_id.as_deref());
    debug!(run_id = %run_id, observer = %observer, "event stream opened");

    let items = services.broadcaster().subscribe(run_id, &observer);

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(to_sse(items)),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn observer_id(client_id: Option<&str>) -> String {
    match client_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => uuid::Uuid::now_v7().simple().to_string(),
    }
}

fn to_sse(
    items: impl Stream<Item = StreamItem> + Send + 'static,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static {
    items.map(|item| {
        let event = match item.to_json() {
            Some(payload) => SseEvent::default().data(payload.to_string()),
            None => SseEvent::default().comment("keep-alive"),
        };
        Ok(event)
    })
}
