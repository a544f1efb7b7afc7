use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::models::ValidationError;

// Errors the analytics endpoint reports to the caller
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Forbidden origin")]
    ForbiddenOrigin,
    #[error("Content-Type must be application/json")]
    UnsupportedContentType,
    #[error("Request body too large")]
    PayloadTooLarge,
    #[error("Failed to read request body")]
    UnreadableBody,
    #[error("Invalid JSON in request body")]
    InvalidJson,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Server misconfiguration")]
    Misconfigured,
    #[error("Failed to track event")]
    Internal,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ForbiddenOrigin => StatusCode::FORBIDDEN,
            ApiError::UnsupportedContentType
            | ApiError::UnreadableBody
            | ApiError::InvalidJson
            | ApiError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Misconfigured | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
