use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::{connection::ConnectionId, publisher::PublishError};

pub type AppResult<T> = Result<T, ApiError>;

/// Seconds a client should wait before retrying a publish that was not acknowledged.
pub const STORE_RETRY_AFTER_SECONDS: u64 = 1;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    pub fn unknown_connection(id: ConnectionId) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "unknown_connection",
            format!("connection {id} is not open on this server"),
        )
        .with_details(json!({ "connection_id": id }))
    }

    /// The publish outcome is unknown; the client retries with the same token.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        let mut error = Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            message,
        );
        error.retry_after = Some(STORE_RETRY_AFTER_SECONDS);
        error
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        ProblemDetails::new(self.status, self.code, self.message)
            .with_details(self.details)
            .retry_after(self.retry_after)
            .into_response()
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::TransientStore(source) => {
                Self::store_unavailable("message was not stored; retry with the same idempotency token")
                    .with_details(json!({ "cause": source.to_string() }))
            }
        }
    }
}
