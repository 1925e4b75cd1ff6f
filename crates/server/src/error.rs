//! Translates the core's internal errors into HTTP status codes without
//! leaking internal error types to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use auth::AuthError;
use repository::RepositoryError;
use thiserror::Error;

/// Everything a handler can fail with, already carrying its response code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    UnprocessableEntity(String),
    #[error("insufficient funds")]
    PaymentRequired,
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::UnprocessableEntity(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            ApiError::PaymentRequired => (StatusCode::PAYMENT_REQUIRED, self.to_string()),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone())
            }
        };
        (status, message).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound => ApiError::Internal("not found".to_string()),
            RepositoryError::DuplicateLogin => ApiError::Conflict("login already taken".to_string()),
            RepositoryError::DuplicateOrder => {
                ApiError::Conflict("order already submitted".to_string())
            }
            RepositoryError::InsufficientFunds => ApiError::PaymentRequired,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Conflict => ApiError::Conflict("login already taken".to_string()),
            AuthError::Unauthorized => ApiError::Unauthorized(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
