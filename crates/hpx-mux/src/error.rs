//! Error handling for the shared connection and its subscriptions.

use std::time::Duration;

use thiserror::Error;

/// Close code for a graceful, completed connection.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code for a protocol violation.
pub const PROTOCOL_ERROR: u16 = 1002;
/// Close code reported when the peer closed without a status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code for a connection lost without a closing handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// The main result type used throughout the crate.
pub type MuxResult<T> = Result<T, MuxError>;

/// Error type for connection, lease and subscription operations.
///
/// The type is `Clone` because a single failed connection attempt is reported
/// to every lease that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The connection was closed with a code other than [`NORMAL_CLOSURE`],
    /// either before the handshake completed or while it was in use.
    #[error("Connection closed: code={code}, reason={reason}")]
    Closed { code: u16, reason: String },

    /// The first inbound message was not the acknowledgment.
    #[error("Didn't acknowledge! (received {received:?})")]
    NotAcknowledged { received: String },

    /// Transport level failure (open, read or write).
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// Inbound message that is not a valid envelope.
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<serde_json::Error> for MuxError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MuxError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::{Error as WsError, error::ProtocolError};

        match e {
            // The peer went away without a closing handshake.
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Io(_)
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                Self::abrupt(e.to_string())
            }
            other => Self::websocket(other.to_string()),
        }
    }
}

impl MuxError {
    /// Create a close error with the given code and reason.
    pub fn closed(code: u16, reason: impl Into<String>) -> Self {
        Self::Closed {
            code,
            reason: reason.into(),
        }
    }

    /// Create an abnormal-closure (1006) error.
    pub fn abrupt(reason: impl Into<String>) -> Self {
        Self::closed(ABNORMAL_CLOSURE, reason)
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Close code carried by this error, if it describes a closed connection.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error is an abnormal closure that subscriptions retry.
    pub fn is_abrupt(&self) -> bool {
        self.code() == Some(ABNORMAL_CLOSURE)
    }
}
