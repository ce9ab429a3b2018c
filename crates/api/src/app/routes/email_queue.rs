use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use ledermail_core::{EmailAddress, EmailJobId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue_email).get(list_emails))
        .route("/process", post(process_queue))
        .route("/stats", get(queue_stats))
        .route("/test", post(send_test_email))
        .route("/:id", get(get_email))
}

/// Run one cycle now (scheduler or admin trigger).
pub async fn process_queue(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.process_queue().await {
        Ok(report) => (StatusCode::OK, Json(dto::ProcessResponse::new(report))).into_response(),
        Err(e) => errors::worker_error_to_response(e),
    }
}

pub async fn enqueue_email(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::EnqueueEmailRequest>,
) -> axum::response::Response {
    let email = match body.into_new_email() {
        Ok(email) => email,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.enqueue(email).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_emails(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    match services.list_recent(query.limit()).await {
        Ok(items) => (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_email(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: EmailJobId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.get(id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => errors::store_error_to_response(ledermail_infra::StoreError::NotFound(id)),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Settings page "send test email": queue it and kick a cycle.
pub async fn send_test_email(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::TestEmailRequest>,
) -> axum::response::Response {
    let to = match EmailAddress::parse(&body.to_email) {
        Ok(to) => to,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.send_test_email(to).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
