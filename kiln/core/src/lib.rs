//! Kiln Core - Asynchronous Session and Streaming-Cancellation Core
//!
//! This crate provides the session-tracking and streaming-cancellation heart
//! of a native inference server, completely independent of any particular
//! engine, transport, or CLI. The engine is consumed through a trait; the
//! HTTP layer, installers, and model discovery live elsewhere.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Callers                              │
//! │      synchronous streaming          asynchronous submission   │
//! │              │                               │                │
//! └──────────────┼───────────────────────────────┼────────────────┘
//!                │                               │
//! ┌──────────────┼───────────────────────────────┼────────────────┐
//! │              ▼          KILN CORE            ▼                │
//! │   ┌──────────────────┐              ┌──────────────────┐      │
//! │   │ StreamController │              │    TaskRunner    │      │
//! │   │  (cancellation,  │              │ (fresh scopes,   │      │
//! │   │   active-stream  │              │  drain-on-       │      │
//! │   │   accounting)    │              │  shutdown)       │      │
//! │   └────────┬─────────┘              └────────┬─────────┘      │
//! │            │                                 ▼                │
//! │            │                        ┌──────────────────┐      │
//! │            │                        │   SessionStore   │      │
//! │            │                        │ (bounded, write- │      │
//! │            │                        │  TTL expiring)   │      │
//! │            ▼                        └──────────────────┘      │
//! │   ┌──────────────────┐                                        │
//! │   │  Engine (trait)  │  external collaborator                 │
//! │   └──────────────────┘                                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two paths through the core:
//!
//! - **Synchronous streaming**: [`StreamController::chat_streaming`] hands
//!   the caller a [`DeltaStream`] and drives the engine directly; the
//!   caller's own consumption loop pulls deltas until the terminal item.
//! - **Asynchronous submission**: [`TaskRunner::run`] registers a session,
//!   launches the unit of work in the background on a fresh, timeout-bounded
//!   [`ExecScope`], and returns the [`SessionId`] immediately; the caller
//!   polls the [`SessionStore`] for status and result.
//!
//! # Key Types
//!
//! - [`SessionStore`]: capacity-bounded, write-TTL-expiring record store
//! - [`TaskRunner`]: background dispatch plus drain-on-shutdown
//! - [`StreamController`]: the streaming-cancellation contract
//! - [`ExecScope`] / [`ScopeHandle`]: cancellable execution scopes
//! - [`Engine`]: the seam to the real inference engine
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kiln_core::{
//!     ExecScope, GenerateRequest, SessionStore, StoreConfig,
//!     StreamController, TaskRunner,
//! };
//!
//! # async fn example(engine: Arc<dyn kiln_core::Engine>) {
//! let store = Arc::new(SessionStore::new(StoreConfig::default()));
//! let runner = TaskRunner::new(Arc::clone(&store), Duration::from_secs(120));
//! let controller = Arc::new(StreamController::new(engine));
//!
//! // Asynchronous submission: the caller gets the id back immediately.
//! let chat = Arc::clone(&controller);
//! let id = runner.run(move |scope, _id| async move {
//!     let outcome = chat.chat(scope, GenerateRequest::new("hello", "qwen")).await?;
//!     Ok(outcome.content.into_bytes())
//! }).unwrap();
//!
//! // ...poll runner.session(id) until it reports a terminal status.
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod error;
pub mod runner;
pub mod scope;
pub mod session;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use engine::{Engine, GenerateOutcome, GenerateRequest, ResponseDelta, StopReason};
pub use error::{CoreError, CANCELED_MSG, DEADLINE_MSG};
pub use runner::TaskRunner;
pub use scope::{ExecScope, ScopeEnd, ScopeHandle};
pub use session::{SessionId, SessionRecord, SessionStatus};
pub use store::{SessionStore, StoreConfig};
pub use streaming::{DeltaStream, StreamController};
