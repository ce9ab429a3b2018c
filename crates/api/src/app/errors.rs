use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use ledermail_core::DomainError;
use ledermail_infra::{StoreError, WorkerError};

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

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        other => json_error(StatusCode::BAD_REQUEST, "validation_error", other.to_string()),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("email job {id} not found"))
        }
        other => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            other.to_string(),
        ),
    }
}

pub fn worker_error_to_response(err: WorkerError) -> axum::response::Response {
    match err {
        WorkerError::AlreadyRunning => json_error(
            StatusCode::CONFLICT,
            "already_running",
            "an email queue cycle is already running",
        ),
        WorkerError::Store(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            e.to_string(),
        ),
        WorkerError::Transport(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "transport_error",
            e.to_string(),
        ),
        WorkerError::Interrupted => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "cycle_interrupted",
            WorkerError::Interrupted.to_string(),
        ),
    }
}
