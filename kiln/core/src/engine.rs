//! Generation Engine Seam
//!
//! Trait definitions for the external generation engine. The core never
//! loads models or samples tokens itself; it consumes an engine as an opaque
//! collaborator that accepts a cancellable execution scope and yields an
//! ordered sequence of response deltas.
//!
//! # Design Philosophy
//!
//! The [`Engine`] trait keeps the cancellation and session logic independent
//! of any particular inference backend. Implementations own their channel
//! and are expected to honor scope cancellation promptly: once the scope
//! ends, the engine stops producing, emits at most one terminal delta, and
//! closes its channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::scope::ExecScope;

/// Why a generation stopped normally
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// The model produced its stop token
    Stop,
    /// The configured token limit was reached
    Length,
}

/// One increment of a streamed response
///
/// A finite sequence of deltas ends in exactly one terminal delta: either
/// `Done` (normal stop) or `Error`, never both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseDelta {
    /// A piece of generated content, in generation order
    Token(String),
    /// Normal end of the sequence
    Done {
        /// Why generation stopped
        reason: StopReason,
    },
    /// Terminal error; the message text is preserved for the consumer
    Error(String),
}

impl ResponseDelta {
    /// Whether this delta ends the sequence
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }
}

/// A structured generation request
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    /// The prompt to send
    pub prompt: String,
    /// Model to use (engine-specific identifier)
    pub model: String,
    /// Maximum tokens in the response (0 = engine default)
    pub max_tokens: u32,
    /// Sampling temperature (0.0-1.0)
    pub temperature: f32,
    /// System prompt (optional, prepended to the conversation)
    pub system: Option<String>,
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: String::new(),
            max_tokens: 0,
            temperature: 0.7,
            system: None,
        }
    }
}

impl GenerateRequest {
    /// Create a new request with prompt and model
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the maximum response length
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// The collected outcome of a fully-consumed generation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateOutcome {
    /// All tokens concatenated in generation order
    pub content: String,
    /// Why generation stopped
    pub reason: StopReason,
}

/// Generation engine trait
///
/// Implement this to plug an inference backend into the core.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name, for logging
    fn name(&self) -> &str;

    /// Produce an ordered, finite sequence of deltas for `request`,
    /// terminating in a stop or error delta.
    ///
    /// The returned channel closes after the terminal delta. The engine must
    /// observe `scope` and stop promptly once it ends, whether or not anyone
    /// is still receiving.
    async fn generate(
        &self,
        scope: ExecScope,
        request: GenerateRequest,
    ) -> Result<mpsc::Receiver<ResponseDelta>, CoreError>;

    /// Release the engine's resources.
    ///
    /// Called at most once, and only while no streams are active; the
    /// [`crate::streaming::StreamController`] enforces that gate.
    async fn unload(&self) -> Result<(), CoreError>;
}
