use axum::Router;

pub mod email_queue;
pub mod system;

/// Router for the email queue endpoints.
pub fn router() -> Router {
    Router::new().nest("/email-queue", email_queue::router())
}
