use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value as JsonValue};
use tracing::info;

use runrelay_core::RunId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_run))
        .route("/:id", get(get_run))
        .route("/:id/replay", post(replay_run))
        .route("/:id/dlq", get(get_dead_letter))
        .route("/:id/emit", post(emit_event))
}

/// POST /runs
pub async fn create_run(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let run = match dto::parse_optional_body::<dto::CreateRunRequest>(&body).and_then(|req| req.validate()) {
        Ok(run) => run,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.producer().create(&run.workflow, run.input, run.fail_at).await {
        Ok(created) => Json(created).into_response(),
        Err(e) => errors::producer_error_to_response(e),
    }
}

/// POST /runs/:id/replay
///
/// The body is optional; `fail_at` absent inherits, `null` clears, a step overrides.
pub async fn replay_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Bytes,
) -> axum::response::Response {
    let run_id = match parse_run_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let fail_at = match dto::parse_optional_body::<dto::ReplayRequest>(&body).and_then(|req| req.fail_at_override()) {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.producer().replay(&run_id, fail_at).await {
        Ok(replayed) => Json(json!({
            "ok": true,
            "run_id": replayed.run_id,
            "seq": replayed.seq,
            "fail_at": replayed.fail_at,
        }))
        .into_response(),
        Err(e) => errors::producer_error_to_response(e),
    }
}

/// GET /runs/:id
pub async fn get_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id = match parse_run_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.producer().lookup(&run_id).await {
        Ok(run) => Json(run).into_response(),
        Err(e) => errors::producer_error_to_response(e),
    }
}

/// GET /runs/:id/dlq
pub async fn get_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id = match parse_run_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.dlq().lookup(&run_id).await {
        Ok(record) => Json(record.to_value()).into_response(),
        Err(e) => errors::dlq_error_to_response(e),
    }
}

/// POST /runs/:id/emit
///
/// Debug hook: publishes an arbitrary record onto the run's event channel.
pub async fn emit_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Bytes,
) -> axum::response::Response {
    let run_id = match parse_run_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req = match dto::parse_body::<dto::EmitRequest>(&body) {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.producer().emit(&run_id, &JsonValue::Object(req.event)).await {
        Ok(()) => {
            info!(run_id = %run_id, "custom event emitted");
            Json(json!({ "ok": true })).into_response()
        }
        Err(e) => errors::producer_error_to_response(e),
    }
}

pub(crate) fn parse_run_id(raw: &str) -> Result<RunId, axum::response::Response> {
    raw.parse().map_err(errors::domain_error_to_response)
}
