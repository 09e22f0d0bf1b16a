//! Domain-specific error types for the tether runtime.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! Connection-scoped failures are reported through this type and never
//! bring down a whole server.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the tether runtime.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A frame did not start with the tether magic sequence.
    #[error("invalid magic bytes: expected TTH1")]
    InvalidMagic,

    /// The frame payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A frame announced a payload above the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A packet could not be decoded, decompressed or decrypted.
    #[error("protocol error: {0}")]
    Protocol(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The operation needs a live connection and there is none.
    #[error("not connected")]
    NotConnected,

    /// The connection was closed while the operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// No correlated reply arrived before the deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Command Errors ───────────────────────────────────────────
    /// No command is registered under this name.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The executor's permission group is below the command's requirement.
    #[error("permission denied for command {command}")]
    PermissionDenied { command: String },

    // ── Queue Errors ─────────────────────────────────────────────
    /// A queue shard is at capacity.
    #[error("queue shard {shard} is full (capacity {capacity})")]
    Capacity { shard: usize, capacity: usize },

    /// The queue pool no longer accepts work.
    #[error("queue pool stopped")]
    QueueStopped,

    // ── Registry Errors ──────────────────────────────────────────
    /// A component of this type is already attached.
    #[error("component {0} already attached")]
    ComponentExists(&'static str),

    /// A task with this name is already running.
    #[error("task {0} already exists")]
    TaskExists(String),

    /// A lifecycle transition was requested from the wrong phase.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Ambient Errors ───────────────────────────────────────────
    /// The HTTP fallback transport failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A configuration file could not be parsed or written.
    #[error("config error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── ItemError ─────────────────────────────────────────────────────

/// Typed failure of a single queue item.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    /// The pool stopped before the item ran.
    #[error("item was cancelled")]
    Cancelled,

    /// The item's job returned an error.
    #[error("item failed: {0}")]
    Failed(String),

    /// The item's job panicked.
    #[error("item panicked")]
    Panicked,

    /// The item's job outlived its per-item timeout.
    #[error("item timed out after {0:?}")]
    TimedOut(Duration),
}

impl TetherError {
    /// Returns `true` for errors that mean the peer is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TetherError::Connection(_) | TetherError::ConnectionClosed | TetherError::NotConnected
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for TetherError {
    fn from(s: String) -> Self {
        TetherError::Other(s)
    }
}

impl From<&str> for TetherError {
    fn from(s: &str) -> Self {
        TetherError::Other(s.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for TetherError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        TetherError::Protocol(format!("envelope: {e}"))
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        TetherError::Protocol(format!("json: {e}"))
    }
}

impl From<toml::de::Error> for TetherError {
    fn from(e: toml::de::Error) -> Self {
        TetherError::Config(e.to_string())
    }
}
