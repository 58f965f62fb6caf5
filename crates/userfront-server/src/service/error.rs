//! Errors surfaced by the access layer.

use axum::http::StatusCode;
use userfront_core::IdError;
use userfront_storage::StorageError;

/// Access layer failure.
///
/// `Clone` because one coalesced execution hands the same result to every
/// waiter. Cache failures never appear here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{backend} unavailable: {message}")]
    Unavailable { backend: String, message: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wraps a storage failure with the operation and operand that caused it.
    pub fn from_storage(context: &str, error: StorageError) -> Self {
        match error {
            StorageError::NotFound { entity, key } => Self::NotFound(format!("{entity} {key}")),
            StorageError::AlreadyExists { entity, key } => {
                Self::Conflict(format!("{entity} {key} already exists"))
            }
            StorageError::Unavailable { backend, message } => Self::Unavailable {
                backend,
                message: format!("{context}: {message}"),
            },
            StorageError::Internal { message } => Self::Internal(format!("{context}: {message}")),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may succeed by trying again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::DeadlineExceeded)
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Invalid(_) => "invalid",
            Self::Conflict(_) => "conflict",
            Self::Unavailable { .. } => "unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<IdError> for ServiceError {
    fn from(e: IdError) -> Self {
        Self::Invalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_keep_operand_context() {
        let err = ServiceError::from_storage(
            "find user id=42",
            StorageError::unavailable("postgres", "connection refused"),
        );
        assert_eq!(
            err,
            ServiceError::Unavailable {
                backend: "postgres".into(),
                message: "find user id=42: connection refused".into(),
            }
        );
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = ServiceError::from_storage("find", StorageError::not_found("user", "id=42"));
        assert_eq!(err, ServiceError::NotFound("user id=42".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ServiceError::invalid("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Conflict("dup".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::DeadlineExceeded.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServiceError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_id_error_is_invalid() {
        let err: ServiceError = userfront_core::parse_user_id("abc").unwrap_err().into();
        assert_eq!(err.kind(), "invalid");
    }
}
