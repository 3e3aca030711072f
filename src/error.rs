//! Error handling for the fleetwatch control plane
//!
//! Provides the crate-wide error type following the usual split: thiserror
//! for error definitions, anyhow only at the binary boundary.

use thiserror::Error;

/// Application result type alias
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Main application error enum
///
/// Covers the error kinds the core distinguishes. Hot ingest paths swallow
/// `Persistence` and `Saturated`; control-plane operations fail fast.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid input: bad UUID, missing required field, interval out of range
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Unknown monitor id, unknown session id, unknown host
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Pairing secret mismatch; message is intentionally generic
    #[error("Invalid credentials")]
    Unauthorized,

    /// Stream-level failure on the agent transport
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Repository failure
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Bounded channel full; the producer dropped instead of blocking
    #[error("Channel saturated: {channel}")]
    Saturated { channel: String },

    /// Configuration load or validation failure
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// HTTP client errors from the probe executor
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AppError {
    /// Create a new Validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a new Transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new Persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create a new Saturated error
    pub fn saturated<S: Into<String>>(channel: S) -> Self {
        Self::Saturated {
            channel: channel.into(),
        }
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable by retrying the operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Validation { .. } => false,
            AppError::NotFound { .. } => false,
            AppError::Unauthorized => false,
            AppError::Transport { .. } => true,
            AppError::Persistence { .. } => true,
            AppError::Saturated { .. } => true,
            AppError::Config { .. } => false,
            AppError::Io(_) => false,
            AppError::Serde(_) => false,
            AppError::Http(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_helpers_produce_expected_variants() {
        assert!(matches!(
            AppError::validation("interval must be >= 1"),
            AppError::Validation { .. }
        ));
        assert!(matches!(
            AppError::not_found("monitor 42"),
            AppError::NotFound { .. }
        ));
        assert!(matches!(
            AppError::saturated("task queue"),
            AppError::Saturated { .. }
        ));
    }

    #[test]
    fn unauthorized_message_is_generic() {
        assert_eq!(AppError::Unauthorized.to_string(), "Invalid credentials");
    }

    #[test]
    fn recoverability_split() {
        assert!(AppError::persistence("db gone").is_recoverable());
        assert!(AppError::saturated("reports").is_recoverable());
        assert!(!AppError::validation("bad uuid").is_recoverable());
        assert!(!AppError::Unauthorized.is_recoverable());
    }
}
