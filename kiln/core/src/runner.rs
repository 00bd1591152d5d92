//! Task Runner
//!
//! Runs caller-supplied units of work in the background, records outcomes in
//! the [`SessionStore`], and drains all outstanding work on shutdown.
//!
//! # Design Philosophy
//!
//! The caller's own scope is expected to end as soon as `run` returns the
//! session id (an HTTP handler answering with the id is the typical caller),
//! so every task gets a *fresh* execution scope bounded by the configured
//! task timeout, deliberately not derived from the caller's scope. The
//! scope's handle is kept in a process-wide registry for the duration of
//! execution so shutdown can cancel everything still in flight, then join
//! exactly the set of tasks that were dispatched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::scope::{ExecScope, ScopeHandle};
use crate::session::{SessionId, SessionRecord, SessionStatus};
use crate::store::SessionStore;

/// Structured payload stored when a task fails
#[derive(Serialize)]
struct ErrorPayload<'a> {
    error: &'a str,
}

/// Dispatches units of work against the session store
pub struct TaskRunner {
    store: Arc<SessionStore>,
    task_timeout: Duration,
    /// Cancellation handles for every task still in flight
    inflight: Arc<DashMap<SessionId, ScopeHandle>>,
    /// Wait-group: every task holds a clone of this sender; shutdown drops
    /// the original and waits for the channel to close
    tracker: Mutex<Option<mpsc::Sender<()>>>,
    drain: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl TaskRunner {
    /// Create a runner whose tasks are each bounded by `task_timeout`
    #[must_use]
    pub fn new(store: Arc<SessionStore>, task_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            store,
            task_timeout,
            inflight: Arc::new(DashMap::new()),
            tracker: Mutex::new(Some(tx)),
            drain: tokio::sync::Mutex::new(rx),
        }
    }

    /// The underlying session store
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Current record for `id`
    pub fn session(&self, id: SessionId) -> Result<SessionRecord, CoreError> {
        self.store.get(id).ok_or(CoreError::NotFound)
    }

    /// Number of tasks currently in flight
    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Launch `task` in the background and return its session id immediately.
    ///
    /// The task receives a fresh [`ExecScope`] bounded by the runner's task
    /// timeout, plus its session id. On success its bytes are stored with
    /// status `Completed`; on failure the error is stored as
    /// `{"error": "..."}` with status `Error`. Never blocks on completion.
    ///
    /// Fails with [`CoreError::Unloaded`] once shutdown has begun.
    pub fn run<F, Fut>(&self, task: F) -> Result<SessionId, CoreError>
    where
        F: FnOnce(ExecScope, SessionId) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, CoreError>> + Send + 'static,
    {
        let keep_alive = match self.tracker.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(CoreError::Unloaded),
        };

        let record = self.store.create()?;
        let id = record.id;

        tracing::info!(session_id = %id, "async: created");

        let (scope, handle) = ExecScope::with_timeout(self.task_timeout);
        self.inflight.insert(id, handle);

        let store = Arc::clone(&self.store);
        let inflight = Arc::clone(&self.inflight);

        tokio::spawn(async move {
            // Dropped when the task ends, releasing the wait-group slot.
            let _keep_alive = keep_alive;

            tracing::info!(session_id = %id, "async: started job");

            let outcome = task(scope, id).await;

            inflight.remove(&id);

            let (status, payload) = match outcome {
                Ok(bytes) => (SessionStatus::Completed, bytes),
                Err(err) => {
                    tracing::error!(session_id = %id, error = %err, "async: task failed");
                    (SessionStatus::Error, encode_error(&err))
                }
            };

            match store.update_status(id, status, payload) {
                Ok(_) => {
                    tracing::info!(session_id = %id, status = %status, "async: completed job");
                }
                Err(err) => {
                    tracing::error!(
                        session_id = %id,
                        error = %err,
                        "async: failed to update session status"
                    );
                }
            }
        });

        Ok(id)
    }

    /// Cancel every in-flight task, then block until all dispatched tasks
    /// have returned.
    ///
    /// This is a join over exactly the set of tasks started, not a fixed
    /// timeout. A task that ignores cancellation of its own scope will keep
    /// shutdown waiting; honoring the scope is the task's responsibility.
    pub async fn shutdown(&self) {
        // Refuse new work and release the runner's own wait-group slot.
        drop(self.tracker.lock().take());

        for entry in self.inflight.iter() {
            tracing::info!(session_id = %entry.key(), "shutdown: cancelling async job");
            entry.value().cancel();
        }

        tracing::info!("shutdown: waiting for async jobs to drain");

        let mut drain = self.drain.lock().await;
        while drain.recv().await.is_some() {}

        tracing::info!("shutdown: all async jobs drained");
    }
}

/// Serialize an error into the stored `{"error": "..."}` payload, falling
/// back to the raw error text so the failure signal is never lost.
fn encode_error(err: &CoreError) -> Vec<u8> {
    let message = err.to_string();

    match serde_json::to_vec(&ErrorPayload { error: &message }) {
        Ok(payload) => payload,
        Err(enc_err) => {
            tracing::error!(error = %enc_err, "async: failed to encode error payload");
            message.into_bytes()
        }
    }
}
