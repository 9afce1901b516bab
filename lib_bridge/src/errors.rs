//! # Bridge Errors
//!
//! One error type for the whole library. The first five variants are the operational taxonomy
//! the bridge reasons about (retry, degrade, skip); the rest wrap ambient failures.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The Kismet source or the TAK target could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A request or connect attempt did not finish in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A snapshot record or an outbound message is malformed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A bounded queue or cache is full.
    #[error("Capacity exceeded for {what}: {size}/{capacity}")]
    Capacity {
        /// The resource that ran out of room.
        what: &'static str,
        /// Occupancy at the time of the rejection.
        size: usize,
        /// Configured capacity.
        capacity: usize,
    },

    /// Writing to an established transport failed, or no transport is established.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The configuration is invalid or could not be read.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection(_)
                | BridgeError::Timeout(_)
                | BridgeError::Transport(_)
                | BridgeError::Io(_)
        )
    }
}

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, BridgeError>;
