use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::warn;

use crate::app::errors;
use crate::app::services::AppServices;

/// GET /healthz
///
/// Healthy only while the broker answers its own health check.
pub async fn healthz(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.broker().healthz().await {
        Ok(broker) => Json(json!({ "ok": true, "broker": broker })).into_response(),
        Err(e) => {
            warn!(error = %e, "broker health check failed");
            errors::json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "broker_unhealthy",
                format!("broker unhealthy: {e}"),
            )
        }
    }
}
