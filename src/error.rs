//! Error types for the frame relay.
//!
//! Faults fall into two groups:
//!
//! - **Connection-scoped**: a producer hung up, stalled, or sent a length
//!   prefix over the limit. These abort only the current producer
//!   connection; the receiver logs them and goes back to listening.
//! - **Process-level**: configuration and HTTP server faults, surfaced to
//!   `main`.
//!
//! A full frame buffer is never an error. Eviction handles it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    #[error("failed to bind producer listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept producer connection")]
    Accept(#[source] io::Error),

    /// Producer closed the stream cleanly between two frames.
    #[error("producer disconnected")]
    Disconnected,

    /// Producer closed the stream in the middle of a prefix or payload.
    #[error("connection lost after {received} of {expected} bytes")]
    ConnectionClosed { received: usize, expected: usize },

    #[error("frame length {len} exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("read did not complete within {duration:?} ({received} of {expected} bytes)")]
    Timeout {
        duration: Duration,
        received: usize,
        expected: usize,
    },

    #[error("socket error")]
    Io(#[from] io::Error),

    #[error("failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP server error")]
    Http(#[source] io::Error),
}

impl RelayError {
    /// True for faults that only end the current producer connection.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            RelayError::Disconnected
                | RelayError::ConnectionClosed { .. }
                | RelayError::FrameTooLarge { .. }
                | RelayError::Timeout { .. }
                | RelayError::Io(_)
        )
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        RelayError::InvalidConfig(reason.into())
    }
}
