use actix_web::{http::StatusCode, HttpResponse};
use thiserror::Error;

use crate::response::Meta;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            // "no rows" and duplicate-key are mapped by sentinel, never by
            // substring matching; everything else in the driver is a 500.
            AppError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            AppError::Database(e) if is_unique_violation(e) => StatusCode::CONFLICT,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(sqlx::Error::RowNotFound) => "not_found",
            AppError::Database(e) if is_unique_violation(e) => "conflict",
            AppError::Database(_) => "internal_error",
            AppError::Validation(_) => "invalid_input",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::RateLimited { .. } => "rate_limited",
            // Buffer at-capacity/draining: transient, retryable conflict.
            AppError::Unavailable(_) => "conflict",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to put on the wire. Storage and internal detail never
    /// leaks; it is logged by the handler layer instead.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(sqlx::Error::RowNotFound) => "resource not found".to_string(),
            AppError::Database(e) if is_unique_violation(e) => "duplicate resource".to_string(),
            AppError::Database(_) | AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, serde::Serialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
    meta: Meta,
}

/// An [`AppError`] bound to the request it occurred on, so the error envelope
/// carries the request id. Built via [`crate::RequestMeta::fail`].
#[derive(Debug, Error)]
#[error("{error}")]
pub struct HttpError {
    pub error: AppError,
    pub request_id: Option<String>,
}

impl HttpError {
    pub fn new(error: AppError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: Some(request_id.into()),
        }
    }

    pub fn bare(error: AppError) -> Self {
        Self {
            error,
            request_id: None,
        }
    }
}

impl actix_web::ResponseError for HttpError {
    fn status_code(&self) -> StatusCode {
        self.error.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let AppError::RateLimited { retry_after_secs } = &self.error {
            builder.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        builder.json(ErrorEnvelope {
            error: ErrorDetail {
                code: self.error.code(),
                message: self.error.public_message(),
            },
            meta: Meta::new(self.request_id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_error_taxonomy() {
        assert_eq!(AppError::Validation("x".into()).code(), "invalid_input");
        assert_eq!(AppError::Unauthorized("x".into()).code(), "unauthorized");
        assert_eq!(AppError::Forbidden("x".into()).code(), "forbidden");
        assert_eq!(AppError::NotFound("x".into()).code(), "not_found");
        assert_eq!(AppError::Conflict("x".into()).code(), "conflict");
        assert_eq!(
            AppError::RateLimited {
                retry_after_secs: 1
            }
            .code(),
            "rate_limited"
        );
        assert_eq!(AppError::Unavailable("x".into()).code(), "conflict");
        assert_eq!(AppError::Internal("x".into()).code(), "internal_error");
    }

    #[test]
    fn row_not_found_maps_to_404_by_sentinel() {
        let err = AppError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn internal_detail_never_leaks() {
        let err = AppError::Internal("secret dsn".into());
        assert_eq!(err.public_message(), "internal server error");
    }

    #[test]
    fn unavailable_is_503_with_transient_conflict_code() {
        let err = AppError::Unavailable("buffer draining".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "conflict");
    }
}
