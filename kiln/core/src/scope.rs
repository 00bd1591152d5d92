//! Execution Scopes
//!
//! A cancellable, optionally deadline-bearing context threaded through an
//! operation, independent of the caller's own request lifetime.
//!
//! # Design Philosophy
//!
//! Every asynchronous task involves two independent scopes: the caller's own
//! scope, which ends as soon as the caller stops waiting (e.g. an HTTP
//! handler returns the session id), and the task's execution scope, created
//! fresh with its own deadline. The two are deliberately not chained; see
//! [`crate::runner::TaskRunner::run`].
//!
//! A scope is the receiving half of a watch channel plus an optional
//! deadline. The [`ScopeHandle`] is the owning half: calling
//! [`ScopeHandle::cancel`] (or dropping the handle) ends every clone of the
//! scope.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{CoreError, CANCELED_MSG, DEADLINE_MSG};

/// Why a scope ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeEnd {
    /// [`ScopeHandle::cancel`] was invoked, or the handle was dropped
    Cancelled,
    /// The scope's deadline elapsed
    DeadlineElapsed,
}

impl ScopeEnd {
    /// The message surfaced to callers and stream consumers
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::Cancelled => CANCELED_MSG,
            Self::DeadlineElapsed => DEADLINE_MSG,
        }
    }

    /// The corresponding error
    #[must_use]
    pub fn into_error(self) -> CoreError {
        CoreError::Cancelled(self.message().to_string())
    }
}

/// Owning half of an execution scope.
///
/// Dropping the handle cancels the scope, so a scope can never outlive its
/// owner unobserved.
#[derive(Debug)]
pub struct ScopeHandle {
    tx: watch::Sender<bool>,
}

impl ScopeHandle {
    /// Cancel the scope. Idempotent; safe to call from any thread.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// A cancellable execution scope.
///
/// Cloning is cheap; all clones observe the same cancellation signal and
/// share the same deadline.
#[derive(Clone, Debug)]
pub struct ExecScope {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl ExecScope {
    /// Create a scope with no deadline.
    #[must_use]
    pub fn new() -> (Self, ScopeHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { rx, deadline: None }, ScopeHandle { tx })
    }

    /// Create a scope that ends on its own after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> (Self, ScopeHandle) {
        let (scope, handle) = Self::new();
        let scope = Self {
            deadline: Some(Instant::now() + timeout),
            ..scope
        };
        (scope, handle)
    }

    /// The scope's deadline, if it has one.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the scope has ended, if it has. Does not wait.
    #[must_use]
    pub fn end_reason(&self) -> Option<ScopeEnd> {
        if *self.rx.borrow() || self.rx.has_changed().is_err() {
            return Some(ScopeEnd::Cancelled);
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(ScopeEnd::DeadlineElapsed);
            }
        }

        None
    }

    /// Whether the scope has ended. Does not wait.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.end_reason().is_some()
    }

    /// The error corresponding to how the scope ended, if it has.
    #[must_use]
    pub fn err(&self) -> Option<CoreError> {
        self.end_reason().map(ScopeEnd::into_error)
    }

    /// Wait until the scope ends and report why.
    ///
    /// Resolves immediately if the scope has already ended. Usable with no
    /// consumer present, so a producer can always observe cancellation.
    pub async fn cancelled(&self) -> ScopeEnd {
        let mut rx = self.rx.clone();

        let explicit = async move {
            loop {
                if *rx.borrow() {
                    return;
                }
                // Err means the handle was dropped, which also cancels.
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                () = explicit => ScopeEnd::Cancelled,
                () = tokio::time::sleep_until(deadline) => ScopeEnd::DeadlineElapsed,
            },
            None => {
                explicit.await;
                ScopeEnd::Cancelled
            }
        }
    }
}
