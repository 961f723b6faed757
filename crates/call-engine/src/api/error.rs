//! Error responses for the HTTP API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::CallEngineError;

/// Error response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    /// Whether the same request may succeed later
    pub retryable: bool,
}

/// A [`CallEngineError`] on its way out of a handler
#[derive(Debug)]
pub struct ApiError(pub CallEngineError);

impl From<CallEngineError> for ApiError {
    fn from(err: CallEngineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            CallEngineError::Validation(_) | CallEngineError::UnsupportedEvent(_) => StatusCode::BAD_REQUEST,
            CallEngineError::InvalidSignature(_) => StatusCode::FORBIDDEN,
            CallEngineError::NotFound(_) => StatusCode::NOT_FOUND,
            CallEngineError::Conflict(_) => StatusCode::CONFLICT,
            CallEngineError::NotEligible(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CallEngineError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}
