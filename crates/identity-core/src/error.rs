//! Error types for directory-backed identity operations.
//!
//! The taxonomy separates failures a caller may retry (the directory could not
//! be reached or did not answer in time) from authoritative answers (the entry
//! does not exist). Only the latter may ever be remembered by a negative cache.

use thiserror::Error;

/// Main error type for identity provider operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Directory server is unavailable (down, busy, refusing connections)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Operation timed out
    #[error("Timeout waiting for directory: {0}")]
    Timeout(String),

    /// Entry not found (authoritative)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Search filter rejected by the directory or by the filter builder
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Bind with the supplied credentials was refused
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// External service error
    #[error("External service error: {service}: {message}")]
    ExternalServiceError {
        /// Service name that failed
        service: String,
        /// Error message
        message: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Specialized result type for identity operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidFilter(_) => "INVALID_FILTER",
            Self::BindFailed(_) => "BIND_FAILED",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true when the failure says nothing about whether the entry exists.
    ///
    /// Transient failures are safe to retry and must never be cached as absence.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable(_) | Self::Timeout(_) | Self::ExternalServiceError { .. }
        )
    }

    /// Returns true if the directory authoritatively reported that the entry is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::InternalError(_) | Self::ConfigError(_) | Self::ExternalServiceError { .. }
        )
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::ValidationError(err.to_string())
    }
}
