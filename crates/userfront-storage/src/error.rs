//! Storage error types for the user storage abstraction layer.
//!
//! This module defines all error types that can occur during storage operations.

use std::fmt;

use userfront_core::ConnectError;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The requested record was not found.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// The kind of record that was not found.
        entity: String,
        /// The lookup key (id or nickname).
        key: String,
    },

    /// A record with the same unique key already exists.
    #[error("{entity} already exists: {key}")]
    AlreadyExists {
        /// The kind of record that conflicts.
        entity: String,
        /// The conflicting unique key.
        key: String,
    },

    /// The backend connection is currently broken.
    #[error("{backend} unavailable: {message}")]
    Unavailable {
        /// Backend name, e.g. `postgres`.
        backend: String,
        /// Description of the connection problem.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if the backend connection is down.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::Conflict,
            Self::Unavailable { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<ConnectError> for StorageError {
    fn from(err: ConnectError) -> Self {
        Self::unavailable(err.backend(), err.to_string())
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Record not found.
    NotFound,
    /// Unique key conflict.
    Conflict,
    /// Infrastructure/connection error.
    Infrastructure,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("user", "id=123");
        assert_eq!(err.to_string(), "user not found: id=123");

        let err = StorageError::already_exists("user", "nickname=ann");
        assert_eq!(err.to_string(), "user already exists: nickname=ann");

        let err = StorageError::unavailable("postgres", "pool closed");
        assert_eq!(err.to_string(), "postgres unavailable: pool closed");
    }

    #[test]
    fn test_error_predicates() {
        let err = StorageError::not_found("user", "1");
        assert!(err.is_not_found());
        assert!(!err.is_unavailable());

        let err = StorageError::unavailable("postgres", "down");
        assert!(!err.is_not_found());
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::not_found("user", "1").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            StorageError::already_exists("user", "ann").category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            StorageError::unavailable("postgres", "down").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(ErrorCategory::Infrastructure.to_string(), "infrastructure");
    }

    #[test]
    fn test_from_connect_error() {
        let err: StorageError = ConnectError::NotConnected {
            backend: "postgres",
        }
        .into();
        assert!(err.is_unavailable());
        assert_eq!(
            err.to_string(),
            "postgres unavailable: postgres connection is not established"
        );
    }
}
