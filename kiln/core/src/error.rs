//! Error Taxonomy
//!
//! Closed error type shared by the session store, the task runner, and the
//! stream controller.
//!
//! # Design Philosophy
//!
//! Failures are never logged-and-dropped. A failure inside a background task
//! is recorded in its session record so polling callers can observe it; a
//! failure inside a stream is surfaced as the terminal stream item so the
//! consumer's loop sees a definitive end state. Nothing in this crate retries
//! automatically; retry policy belongs to the caller.

use thiserror::Error;

/// Message carried by a [`CoreError::Cancelled`] when a scope was cancelled
/// explicitly.
pub const CANCELED_MSG: &str = "context canceled";

/// Message carried by a [`CoreError::Cancelled`] when a scope's deadline
/// elapsed.
pub const DEADLINE_MSG: &str = "deadline exceeded";

/// Errors produced by the session and streaming core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Session id is unknown, expired, or was evicted
    #[error("session not found")]
    NotFound,

    /// An execution scope ended before the operation finished.
    ///
    /// The message is either [`CANCELED_MSG`] or [`DEADLINE_MSG`] and is
    /// displayed verbatim so callers (and stream consumers) can match on it.
    #[error("{0}")]
    Cancelled(String),

    /// The generation engine itself failed; the message text is preserved
    #[error("engine: {0}")]
    Engine(String),

    /// Teardown was attempted while streams are still delivering
    #[error("cannot unload: {active} active streams")]
    Busy {
        /// Number of streams active at the time of the attempt
        active: usize,
    },

    /// Operation attempted after the engine was unloaded or the runner
    /// was shut down
    #[error("engine has been unloaded")]
    Unloaded,

    /// Failed to encode a payload for storage.
    ///
    /// Recovered locally wherever it can occur: the runner falls back to
    /// storing the raw error text rather than masking the original failure.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// A `Cancelled` error for an explicitly cancelled scope
    #[must_use]
    pub fn canceled() -> Self {
        Self::Cancelled(CANCELED_MSG.to_string())
    }

    /// A `Cancelled` error for an elapsed deadline
    #[must_use]
    pub fn deadline_exceeded() -> Self {
        Self::Cancelled(DEADLINE_MSG.to_string())
    }

    /// Whether this error came from a scope ending
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
