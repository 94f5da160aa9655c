//! Shoal error abstractions.

use thiserror::Error;

/// Errors surfaced by the request log manager.
#[derive(Debug, Error)]
pub enum LogError {
    /// The head file length or a payload checksum is invalid.
    ///
    /// This is fatal to the local node and is translated upstream into a
    /// recovery request against a peer.
    #[error("request log corrupt: {0}")]
    Corrupt(String),
    /// A write request is already staged in the prepared slot.
    #[error("a write request is already prepared, only one in-flight write is allowed per node")]
    AlreadyPrepared,
    /// No write request is currently staged in the prepared slot.
    #[error("no write request is currently prepared")]
    NotPrepared,
    /// A replica was handed an id below the point its own log has advanced to.
    #[error("stale inc_id {given}, local log has already advanced to {expected}")]
    Stale { given: u32, expected: u32 },
    /// No log entry matches the requested id.
    #[error("no request log entry found for the requested id")]
    NotFound,
    /// Underlying I/O failure; the affected node demotes itself.
    #[error("request log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the coordination service client.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The target znode does not exist.
    #[error("znode not found: {0}")]
    NoNode(String),
    /// The target znode already exists.
    #[error("znode already exists: {0}")]
    NodeExists(String),
    /// The target znode still has children.
    #[error("znode has children and can not be deleted: {0}")]
    NotEmpty(String),
    /// Transient connection loss; the session may yet be re-established.
    #[error("coordination service connection lost")]
    Disconnected,
    /// The session has expired; all of its ephemerals must be assumed gone.
    #[error("coordination session expired")]
    SessionExpired,
    /// A znode payload failed to decode.
    #[error("malformed znode payload at {0}")]
    BadData(String),
    /// The coordination service handle has been closed.
    #[error("coordination service handle closed")]
    Closed,
}

impl CoordinationError {
    /// Whether this error may clear on its own once the session re-establishes.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// A blocking wait on a coordination predicate expired.
#[derive(Debug, Error)]
#[error("timed out waiting for {0}")]
pub struct WaitTimeout(pub String);

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = std::result::Result<T, ShutdownError>;
