/// Unified error handling for the mygate proxy
///
/// Every failure in the proxy is an explicit value: socket errors, codec
/// errors, authentication failures, pool exhaustion and configuration
/// problems all travel through `ProxyError`.

use std::fmt;
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Socket-level errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Peer closed its side of the connection
    #[error("Connection closed by peer")]
    PeerClosed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire protocol decode errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Client or backend authentication rejected
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// No node of the required role has an available connection
    #[error("No backend available: {message}")]
    BackendUnavailable { message: String },

    /// Backend connection errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// A bounded pool refused an allocation
    #[error("Capacity exhausted: {what}")]
    Capacity { what: String },

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors raised while decoding MySQL packets
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("packet truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("missing NUL terminator in {field}")]
    Unterminated { field: &'static str },

    #[error("packet of {len} bytes exceeds the maximum payload")]
    TooLarge { len: usize },

    #[error("unexpected packet: {0}")]
    Unexpected(String),
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Convenience methods for creating specific error types
impl ProxyError {
    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        ProxyError::Backend {
            message: message.into(),
        }
    }

    /// Create a backend-unavailable error
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        ProxyError::BackendUnavailable {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        ProxyError::Auth {
            message: message.into(),
        }
    }

    /// Create a capacity error
    pub fn capacity<S: Into<String>>(what: S) -> Self {
        ProxyError::Capacity { what: what.into() }
    }

    /// Create a protocol error from a free-form message
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ProxyError::Protocol(ProtocolError::Unexpected(message.into()))
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ProxyError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        ProxyError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (the reconnect timers will retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProxyError::Network(_) => true,
            ProxyError::PeerClosed => true,
            ProxyError::Backend { .. } => true,
            ProxyError::BackendUnavailable { .. } => true,
            ProxyError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ProxyError::Config(_) => ErrorSeverity::Critical,
            ProxyError::Internal { .. } => ErrorSeverity::Critical,
            ProxyError::Network(_) => ErrorSeverity::Warning,
            ProxyError::Backend { .. } => ErrorSeverity::Warning,
            ProxyError::BackendUnavailable { .. } => ErrorSeverity::Warning,
            ProxyError::Capacity { .. } => ErrorSeverity::Warning,
            ProxyError::Timeout { .. } => ErrorSeverity::Warning,
            ProxyError::PeerClosed => ErrorSeverity::Info,
            ProxyError::Auth { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
