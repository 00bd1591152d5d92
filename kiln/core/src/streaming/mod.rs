//! Streaming Delivery and Cancellation
//!
//! This module owns the contract between a token-streaming producer and its
//! consumer: an ordered, lazy sequence of response deltas that always
//! reaches a well-defined terminal state, however the request ends.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     StreamController                        │
//! │                                                             │
//! │  Engine::generate ──► forwarder task ──► DeltaStream        │
//! │        │                   │                  │             │
//! │        │            select! on scope    scope checked       │
//! │        │            (recv and send)     before each item    │
//! │        │                   │                  │             │
//! │        └── active-stream counter gates unload() ──► Busy    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # The cancellation contract
//!
//! - Scope ended before delivery begins: no content items, one terminal
//!   error item (`"context canceled"`), then the sequence closes.
//! - Scope ended mid-stream: items already consumed stand, one terminal
//!   error item follows, then the sequence closes.
//! - Consumer stops reading: the producer still observes the scope ending
//!   and closes unilaterally; it never deadlocks waiting on a reader.
//! - The active-stream counter moves exactly once up and once down per
//!   stream, on every exit path.
//! - Unloading the engine while the counter is non-zero fails with `Busy`.

mod controller;
mod delta_stream;

pub use controller::StreamController;
pub use delta_stream::DeltaStream;
