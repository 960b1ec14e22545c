//! HTTP error mapping for handler failures.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use radportal_notifications::NotificationError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not-found"),
            Self::Notification(e) if e.is_validation() => (StatusCode::BAD_REQUEST, "invalid"),
            Self::Notification(NotificationError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not-found")
            }
            Self::Notification(_) => (StatusCode::INTERNAL_SERVER_ERROR, "exception"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({
            "error": code,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
