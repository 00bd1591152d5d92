//! Session Value Types
//!
//! A session is a tracked unit of background work with a status/result
//! record. These types are pure values: they are created by the
//! [`crate::runner::TaskRunner`], stored and evicted by the
//! [`crate::store::SessionStore`], and only ever read by everyone else.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session, generated at creation and immutable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a background session
///
/// The state machine only moves forward:
/// `New -> Processing -> { Completed, Error }`. The transition to
/// `Processing` is implicit at dispatch; the polling contract treats
/// "not yet terminal" as processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session created, work not yet dispatched
    New,
    /// Work is running in the background
    Processing,
    /// Work returned a result
    Completed,
    /// Work failed, or its execution scope expired
    Error,
}

impl SessionStatus {
    /// Whether this status is terminal (no further transitions)
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parse a status from its label
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "new" => Some(Self::New),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A session's status/result record
///
/// Mutated only through [`crate::store::SessionStore::update_status`]; the
/// background task that owns the session is its single writer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session ID
    pub id: SessionId,
    /// Current status
    pub status: SessionStatus,
    /// Result payload; empty until terminal. On `Error` this holds a
    /// structured error payload (`{"error": "..."}`).
    pub result: Vec<u8>,
    /// When the session was created (Unix timestamp ms)
    pub started_at_ms: u64,
    /// When the session reached a terminal status (Unix timestamp ms).
    /// `None` until then; set exactly once.
    pub completed_at_ms: Option<u64>,
}

impl SessionRecord {
    /// Create a fresh record in status `New`
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            status: SessionStatus::New,
            result: Vec::new(),
            started_at_ms: now_ms(),
            completed_at_ms: None,
        }
    }

    /// Whether the record has reached a terminal status
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Current Unix timestamp in milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
