//! Error types for the Helios protocol engine.
//!
//! `HeliosError` covers everything a caller of the engine can observe.
//! `RequestError` is the outcome of a request issued *by* the server to a
//! peer and is never sent back over the wire.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Helios engine.
#[derive(Debug, Error)]
pub enum HeliosError {
    // Protocol errors
    #[error("Message format does not match the Helios-Starling protocol: {message}")]
    ProtocolFormat {
        message: String,
        /// Structured validation issues, if any.
        details: Option<Value>,
    },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Method {method} timed out after {timeout:?}")]
    MethodTimeout { method: String, timeout: Duration },

    #[error("Request {request_id} already finished")]
    AlreadyFinished { request_id: String },

    // Method registry errors
    #[error("Invalid method name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Method {name:?} already exists")]
    DuplicateName { name: String },

    #[error("Namespace {namespace:?} is reserved")]
    ReservedNamespace { namespace: String },

    // Recovery errors
    #[error("State namespace {namespace:?} already registered")]
    DuplicateNamespace { namespace: String },

    #[error("Invalid recovery token: {reason}")]
    InvalidToken { reason: String },

    #[error("Failed to restore state for namespace {namespace}: {message}")]
    NamespaceRestore { namespace: String, message: String },

    // Registry / proxy errors
    #[error("Starling not found: {0}")]
    NotFound(String),

    #[error("Invalid proxy target: {reason}")]
    InvalidTarget { reason: String },

    #[error("Message kind not supported: {reason}")]
    UnsupportedKind { reason: String },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // Outbound request errors
    #[error(transparent)]
    Request(#[from] RequestError),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Application handler errors
    #[error("{code}: {message}")]
    Handler { code: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for Helios operations.
pub type Result<T> = std::result::Result<T, HeliosError>;

impl From<serde_json::Error> for HeliosError {
    fn from(err: serde_json::Error) -> Self {
        HeliosError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl HeliosError {
    /// Build an application error carrying an explicit wire code.
    pub fn handler(code: impl Into<String>, message: impl Into<String>) -> Self {
        HeliosError::Handler {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Convert to a wire error code.
    ///
    /// These are the `error.code` strings peers see in `response` and
    /// `error` frames.
    pub fn code(&self) -> &str {
        match self {
            HeliosError::ProtocolFormat { .. } => "INVALID_MESSAGE_FORMAT",
            HeliosError::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            HeliosError::MethodTimeout { .. } => "METHOD_TIMEOUT",
            HeliosError::AlreadyFinished { .. } => "ALREADY_FINISHED",
            HeliosError::InvalidName { .. }
            | HeliosError::DuplicateName { .. }
            | HeliosError::ReservedNamespace { .. } => "INVALID_METHOD",
            HeliosError::InvalidToken { .. } => "INVALID_TOKEN",
            HeliosError::InvalidTarget { .. } => "INVALID_TARGET",
            HeliosError::UnsupportedKind { .. } => "UNSUPPORTED_KIND",
            HeliosError::Request(e) => e.code(),
            HeliosError::Handler { code, .. } => code,
            // All other errors are internal errors
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Failure of a request sent by the server to a peer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("Request to method {method} timed out after {elapsed:?}")]
    Timeout { method: String, elapsed: Duration },

    #[error("Request cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Starling is not connected")]
    NotLive,

    #[error("{code}: {message}")]
    Remote {
        code: String,
        message: String,
        details: Option<Value>,
    },
}

impl RequestError {
    pub fn code(&self) -> &str {
        match self {
            RequestError::Timeout { .. } => "REQUEST_TIMEOUT",
            RequestError::Cancelled { .. } => "REQUEST_CANCELLED",
            RequestError::NotLive => "NOT_CONNECTED",
            RequestError::Remote { code, .. } => code,
        }
    }

    /// Check if a queued request that failed this way should be retried.
    ///
    /// An answer from the peer is final; only missing answers are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RequestError::Timeout { .. } | RequestError::NotLive)
    }
}

/// Error reported by a transport when a frame cannot be sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HeliosError::MethodNotFound {
            method: "foo:bar".into(),
        };
        assert_eq!(err.to_string(), "Method not found: foo:bar");
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(
            HeliosError::MethodNotFound {
                method: "x".into()
            }
            .code(),
            "METHOD_NOT_FOUND"
        );
        assert_eq!(
            HeliosError::from(RequestError::Cancelled {
                reason: "closed".into()
            })
            .code(),
            "REQUEST_CANCELLED"
        );
        assert_eq!(
            HeliosError::handler("USER_EXISTS", "taken").code(),
            "USER_EXISTS"
        );
        assert_eq!(
            HeliosError::NotFound("abc".into()).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_retryable_request_errors() {
        assert!(RequestError::Timeout {
            method: "m".into(),
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(RequestError::NotLive.is_retryable());
        assert!(!RequestError::Cancelled {
            reason: "closed".into()
        }
        .is_retryable());
        assert!(!RequestError::Remote {
            code: "NOPE".into(),
            message: "no".into(),
            details: None
        }
        .is_retryable());
    }
}
