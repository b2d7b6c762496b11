//! Error types for backscroll.
//!
//! Transport failures are surfaced to the caller and never retried here.
//! Decode failures concern a single pushed item and are dropped by the
//! channel after logging. A race timeout is not an error at all.

use crate::model::Direction;
use std::io;
use thiserror::Error;

/// Result type alias for backscroll operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Subscription-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The subscription could not be opened.
    #[error("failed to open subscription: {0}")]
    Connect(String),

    /// The server reported a failure on an open subscription.
    #[error("server error: {0}")]
    Server(String),

    /// The event stream ended without a close signal.
    #[error("subscription dropped without close")]
    Dropped,

    /// Reading the underlying stream failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A single pushed item could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not valid JSON for a message.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload decoded but carries no identifier.
    #[error("payload has an empty message id")]
    MissingId,

    /// Heartbeat payload is malformed.
    #[error("malformed heartbeat: {0}")]
    Heartbeat(String),
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Subscription-level failure.
    #[error("transport error on {direction} channel: {source}")]
    Transport {
        /// Direction of the failing channel.
        direction: Direction,
        /// Underlying failure.
        #[source]
        source: TransportError,
    },

    /// The channel already failed and cannot be reused.
    #[error("{0} channel has terminated after an error")]
    Terminated(Direction),

    /// Keep-loading was requested but no heartbeat has been seen.
    #[error("no heartbeat recorded for {0} direction")]
    NoHeartbeat(Direction),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = Error::Transport {
            direction: Direction::Next,
            source: TransportError::Server("502".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("next channel"));
        assert!(msg.contains("502"));
    }

    #[test]
    fn test_io_error_converts() {
        let err: TransportError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, TransportError::Io(ref s) if s.contains("pipe")));
    }

    #[test]
    fn test_terminated_display() {
        assert_eq!(
            Error::Terminated(Direction::Previous).to_string(),
            "previous channel has terminated after an error"
        );
    }
}
