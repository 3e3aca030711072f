//! Stream error taxonomy
//!
//! Maps raw stream failures into a fixed classification the session layer
//! exposes to its callers. A subset of classes is marked recoverable,
//! which the UI layer uses to decide whether to offer reconnect.

use thiserror::Error;

/// Carrier-level status codes surfaced by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierCode {
    Canceled,
    DeadlineExceeded,
    Unavailable,
    ResourceExhausted,
    Aborted,
    Internal,
    Unknown,
}

/// Error produced by stream send/recv operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("carrier error ({code:?}): {message}")]
    Carrier { code: CarrierCode, message: String },
}

/// Fixed classification of stream errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Eof,
    Canceled,
    DeadlineExceeded,
    CarrierCanceled,
    CarrierDeadlineExceeded,
    CarrierUnavailable,
    CarrierResourceExhausted,
    CarrierAborted,
    CarrierInternal,
    CarrierUnknown,
    NetworkTimeout,
    NetworkTemporary,
    NetworkError,
    UnknownError,
}

impl ErrorClass {
    /// Whether the UI layer should offer reconnect for this class
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorClass::NetworkTimeout
                | ErrorClass::NetworkTemporary
                | ErrorClass::CarrierUnavailable
                | ErrorClass::CarrierDeadlineExceeded
                | ErrorClass::CarrierResourceExhausted
                | ErrorClass::CarrierAborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Eof => "eof",
            ErrorClass::Canceled => "canceled",
            ErrorClass::DeadlineExceeded => "deadline-exceeded",
            ErrorClass::CarrierCanceled => "carrier-canceled",
            ErrorClass::CarrierDeadlineExceeded => "carrier-deadline-exceeded",
            ErrorClass::CarrierUnavailable => "carrier-unavailable",
            ErrorClass::CarrierResourceExhausted => "carrier-resource-exhausted",
            ErrorClass::CarrierAborted => "carrier-aborted",
            ErrorClass::CarrierInternal => "carrier-internal",
            ErrorClass::CarrierUnknown => "carrier-unknown",
            ErrorClass::NetworkTimeout => "network-timeout",
            ErrorClass::NetworkTemporary => "network-temporary",
            ErrorClass::NetworkError => "network-error",
            ErrorClass::UnknownError => "unknown-error",
        }
    }
}

/// Classify a stream error into the fixed taxonomy
pub fn classify(err: &StreamError) -> ErrorClass {
    match err {
        StreamError::Closed => ErrorClass::Eof,
        StreamError::Canceled => ErrorClass::Canceled,
        StreamError::DeadlineExceeded => ErrorClass::DeadlineExceeded,
        StreamError::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ErrorClass::NetworkTimeout
            }
            std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ErrorClass::NetworkTemporary,
            std::io::ErrorKind::UnexpectedEof => ErrorClass::Eof,
            _ => ErrorClass::NetworkError,
        },
        StreamError::Protocol(_) => ErrorClass::UnknownError,
        StreamError::Carrier { code, .. } => match code {
            CarrierCode::Canceled => ErrorClass::CarrierCanceled,
            CarrierCode::DeadlineExceeded => ErrorClass::CarrierDeadlineExceeded,
            CarrierCode::Unavailable => ErrorClass::CarrierUnavailable,
            CarrierCode::ResourceExhausted => ErrorClass::CarrierResourceExhausted,
            CarrierCode::Aborted => ErrorClass::CarrierAborted,
            CarrierCode::Internal => ErrorClass::CarrierInternal,
            CarrierCode::Unknown => ErrorClass::CarrierUnknown,
        },
    }
}
