//! Session Store
//!
//! Capacity-bounded, time-expiring storage for session records. This is the
//! single source of truth for session status and results.
//!
//! # Design Philosophy
//!
//! The store bounds memory for abandoned or never-polled sessions two ways:
//! entries expire a fixed duration after their *last write* (a write
//! refreshes the clock, a read does not), and the total entry count is
//! capped, evicting the least-recently-written entry when full. Both limits
//! are enforced without a global lock: the backing map is sharded, so
//! updates for different sessions never contend, while updates for the same
//! session serialize on its entry lock.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::CoreError;
use crate::session::{now_ms, SessionId, SessionRecord, SessionStatus};

/// Configuration for the session store
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Maximum number of records held at once; the least-recently-written
    /// record is evicted when the cap is exceeded
    pub capacity: usize,
    /// Time-to-live measured from a record's last write
    pub ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Duration::from_secs(300),
        }
    }
}

impl StoreConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum record count
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the time-to-live from last write
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// A stored record plus its write clock
#[derive(Clone, Debug)]
struct Entry {
    record: SessionRecord,
    written_at: Instant,
}

/// Bounded, expiring map of session records
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Entry>,
    capacity: usize,
    ttl: Duration,
}

impl SessionStore {
    /// Create a store with the given configuration.
    ///
    /// A capacity of zero is treated as one: the store must always be able
    /// to accept an insertion after eviction.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity: config.capacity.max(1),
            ttl: config.ttl,
        }
    }

    /// Allocate a new session record in status `New`
    pub fn create(&self) -> Result<SessionRecord, CoreError> {
        self.make_room();

        let record = SessionRecord::new(SessionId::new());
        self.sessions.insert(
            record.id,
            Entry {
                record: record.clone(),
                written_at: Instant::now(),
            },
        );

        tracing::debug!(session_id = %record.id, "store: session created");

        Ok(record)
    }

    /// Current record for `id`, or `None` if unknown, evicted, or expired.
    ///
    /// Reading does not refresh the TTL. Expired entries are removed lazily
    /// here rather than waiting for the next insertion to purge them.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<SessionRecord> {
        let expired = {
            let entry = self.sessions.get(&id)?;
            if entry.written_at.elapsed() < self.ttl {
                return Some(entry.record.clone());
            }
            true
        };

        if expired {
            self.sessions
                .remove_if(&id, |_, entry| entry.written_at.elapsed() >= self.ttl);
            tracing::debug!(session_id = %id, "store: session expired");
        }

        None
    }

    /// Apply a status transition to `id`, atomically with respect to other
    /// updates for the same id.
    ///
    /// Terminal statuses are sticky: the first terminal write wins, and any
    /// later update returns the stored record unchanged. `completed_at_ms`
    /// is set exactly once, at the terminal transition. The write refreshes
    /// the entry's TTL clock.
    pub fn update_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        result: Vec<u8>,
    ) -> Result<SessionRecord, CoreError> {
        let expired = {
            let mut entry = self.sessions.get_mut(&id).ok_or(CoreError::NotFound)?;

            if entry.written_at.elapsed() < self.ttl {
                if entry.record.is_terminal() {
                    return Ok(entry.record.clone());
                }

                entry.record.status = status;
                entry.record.result = result;
                if status.is_terminal() {
                    entry.record.completed_at_ms = Some(now_ms());
                }
                entry.written_at = Instant::now();

                return Ok(entry.record.clone());
            }
            true
        };

        if expired {
            self.sessions
                .remove_if(&id, |_, entry| entry.written_at.elapsed() >= self.ttl);
        }

        Err(CoreError::NotFound)
    }

    /// Number of records currently held, including not-yet-purged expired ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Purge expired entries, then evict least-recently-written entries
    /// until an insertion fits under the cap.
    fn make_room(&self) {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.written_at.elapsed() >= self.ttl)
            .map(|entry| *entry.key())
            .collect();

        for id in expired {
            self.sessions
                .remove_if(&id, |_, entry| entry.written_at.elapsed() >= self.ttl);
        }

        while self.sessions.len() >= self.capacity {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|entry| entry.written_at)
                .map(|entry| *entry.key());

            let Some(id) = oldest else { break };
            if self.sessions.remove(&id).is_some() {
                tracing::warn!(session_id = %id, "store: evicted session at capacity");
            }
        }
    }
}
