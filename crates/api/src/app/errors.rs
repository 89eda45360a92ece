use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use runrelay_core::DomainError;
use runrelay_infra::{DlqLookupError, ProducerError};

pub fn producer_error_to_response(err: ProducerError) -> axum::response::Response {
    match err {
        ProducerError::NotFound(run_id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("run not found: {run_id}"))
        }
        ProducerError::Upstream(e) => json_error(StatusCode::BAD_GATEWAY, "upstream_unavailable", e.to_string()),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        e @ (DomainError::Validation(_) | DomainError::UnknownStep(_)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
    }
}

pub fn dlq_error_to_response(err: DlqLookupError) -> axum::response::Response {
    match err {
        DlqLookupError::NotFound(run_id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no dead letter for run {run_id}"),
        ),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
