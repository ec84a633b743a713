//! Error types for STOMP over WebSocket.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use stomp_websocket::{Error, Result};
//!
//! fn decode(decoder: &mut BufferingStompDecoder, chunk: &[u8]) -> Result<()> {
//!     for message in decoder.decode(chunk)? {
//!         println!("{:?}", message.headers().command());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Framing | [`Error::Framing`] |
//! | Back-pressure | [`Error::SessionLimitExceeded`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::ConnectTimeout`], [`Error::TransportFailure`] |
//! | Processing | [`Error::Processing`], [`Error::SessionNotOpen`], [`Error::ImmutableHeaders`], [`Error::InvalidArgument`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`], [`Error::Url`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::SessionId;
use crate::transport::CloseStatus;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Raised eagerly at setup or connect time: duplicate protocol
    /// registration, heartbeats without a scheduler, empty transport chain.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Framing Errors
    // ========================================================================
    /// Malformed or oversized frame data.
    ///
    /// Fatal to the session that produced it.
    #[error("Framing error: {message}")]
    Framing {
        /// Description of the framing violation.
        message: String,
    },

    // ========================================================================
    // Back-pressure Errors
    // ========================================================================
    /// A session send-time or buffer-size limit was exceeded.
    ///
    /// The caller is expected to close the session with `status`.
    #[error("Session limit exceeded: {message}")]
    SessionLimitExceeded {
        /// Description of the exceeded limit.
        message: String,
        /// Status to close the session with.
        status: CloseStatus,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection could not be established or was lost.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed while an operation was in progress.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A connect attempt did not complete in time.
    #[error("Connect timed out after {timeout_ms}ms: {target}")]
    ConnectTimeout {
        /// Description of the attempt that timed out.
        target: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// A SockJS transport failed.
    #[error("SockJS transport failure in session {session_id}: {message}")]
    TransportFailure {
        /// Description of the failure.
        message: String,
        /// SockJS session id of the failed attempt.
        session_id: String,
    },

    // ========================================================================
    // Processing Errors
    // ========================================================================
    /// A message could not be processed or forwarded.
    #[error("Processing error: {message}")]
    Processing {
        /// Description of the processing error.
        message: String,
    },

    /// Operation attempted on a session that is not open.
    #[error("Session {session_id} is not open")]
    SessionNotOpen {
        /// The session id.
        session_id: SessionId,
    },

    /// Attempt to modify frozen message headers.
    #[error("Message headers are immutable")]
    ImmutableHeaders,

    /// Invalid argument.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a framing error.
    #[inline]
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Creates a session limit exceeded error.
    #[inline]
    pub fn session_limit_exceeded(message: impl Into<String>, status: CloseStatus) -> Self {
        Self::SessionLimitExceeded {
            message: message.into(),
            status,
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connect timeout error.
    #[inline]
    pub fn connect_timeout(target: impl Into<String>, timeout_ms: u64) -> Self {
        Self::ConnectTimeout {
            target: target.into(),
            timeout_ms,
        }
    }

    /// Creates a SockJS transport failure.
    #[inline]
    pub fn transport_failure(message: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
            session_id: session_id.into(),
        }
    }

    /// Creates a processing error.
    #[inline]
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }

    /// Creates a session not open error.
    #[inline]
    pub fn session_not_open(session_id: SessionId) -> Self {
        Self::SessionNotOpen { session_id }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a framing error.
    #[inline]
    #[must_use]
    pub fn is_framing_error(&self) -> bool {
        matches!(self, Self::Framing { .. })
    }

    /// Returns the close status if this is a session limit violation.
    #[inline]
    #[must_use]
    pub fn limit_exceeded_status(&self) -> Option<CloseStatus> {
        match self {
            Self::SessionLimitExceeded { status, .. } => Some(status.clone()),
            _ => None,
        }
    }

    /// Returns `true` if this is a session limit violation.
    #[inline]
    #[must_use]
    pub fn is_session_limit_exceeded(&self) -> bool {
        matches!(self, Self::SessionLimitExceeded { .. })
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::ConnectTimeout { .. }
                | Self::TransportFailure { .. }
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
