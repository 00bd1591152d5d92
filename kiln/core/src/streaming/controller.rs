//! Stream Controller Implementation
//!
//! Governs token-by-token generation for a single request: delivers an
//! ordered, lazy sequence of response deltas while enforcing cancellation,
//! active-stream accounting, and the teardown guard over the shared engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine::{Engine, GenerateOutcome, GenerateRequest, ResponseDelta, StopReason};
use crate::error::{CoreError, CANCELED_MSG, DEADLINE_MSG};
use crate::scope::ExecScope;
use crate::streaming::DeltaStream;

/// Releases one active-stream slot on drop, so the decrement happens exactly
/// once on every exit path.
struct StreamSlot {
    counter: Arc<AtomicUsize>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Concurrency-safe front door to the shared generation engine.
///
/// Any number of streams may run at once; unloading the engine is the only
/// exclusive operation, gated by the active-stream counter.
pub struct StreamController {
    engine: Arc<dyn Engine>,
    active_streams: Arc<AtomicUsize>,
    /// Guards the unloaded flag; stream admission takes this lock so a
    /// stream can never start between the unload check and the flag flip
    unloaded: Mutex<bool>,
}

impl StreamController {
    /// Create a controller over the shared engine
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            active_streams: Arc::new(AtomicUsize::new(0)),
            unloaded: Mutex::new(false),
        }
    }

    /// Number of in-flight streaming deliveries
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Stream a generation under the caller's scope.
    ///
    /// Returns the sequence handle immediately; errors before any delivery
    /// (scope already ended, engine refused, already unloaded) are returned
    /// directly rather than as stream items. Cancelling `scope` is the only
    /// way to stop the stream early and always closes the sequence within
    /// one cancellation-check interval, whether or not anyone is consuming.
    pub async fn chat_streaming(
        &self,
        scope: ExecScope,
        request: GenerateRequest,
    ) -> Result<DeltaStream, CoreError> {
        if let Some(err) = scope.err() {
            return Err(err);
        }

        let slot = self.acquire()?;

        let mut engine_rx = match self.engine.generate(scope.clone(), request).await {
            Ok(rx) => rx,
            Err(err) => {
                drop(slot);
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel::<ResponseDelta>(1);
        let forward_scope = scope.clone();
        let engine_name = self.engine.name().to_string();

        tokio::spawn(async move {
            // Held for the forwarder's whole life; dropping it on any exit
            // path releases the stream's slot.
            let _slot = slot;

            loop {
                // Pull the next delta, bailing out as soon as the scope ends
                // so an abandoned stream never pins the engine.
                let delta = tokio::select! {
                    biased;
                    msg = engine_rx.recv() => match msg {
                        Some(delta) => delta,
                        None => break,
                    },
                    _ = forward_scope.cancelled() => break,
                };

                let last = delta.is_terminal();

                // Hand the delta over, preferring delivery when both a
                // permit and cancellation are ready.
                tokio::select! {
                    biased;
                    permit = tx.reserve() => match permit {
                        Ok(permit) => permit.send(delta),
                        // Consumer dropped the stream.
                        Err(_) => break,
                    },
                    _ = forward_scope.cancelled() => break,
                }

                if last {
                    break;
                }
            }

            tracing::debug!(engine = %engine_name, "stream: forwarder closed");
        });

        Ok(DeltaStream::new(rx, scope))
    }

    /// Run a generation to completion and return the collected outcome.
    ///
    /// Drives [`Self::chat_streaming`] through its own consumption loop; a
    /// terminal error delta becomes an `Err`.
    pub async fn chat(
        &self,
        scope: ExecScope,
        request: GenerateRequest,
    ) -> Result<GenerateOutcome, CoreError> {
        let mut stream = self.chat_streaming(scope, request).await?;

        let mut content = String::new();
        let mut reason = StopReason::Stop;

        while let Some(delta) = stream.next().await {
            match delta {
                ResponseDelta::Token(text) => content.push_str(&text),
                ResponseDelta::Done { reason: r } => reason = r,
                ResponseDelta::Error(message) => return Err(stream_error(message)),
            }
        }

        Ok(GenerateOutcome { content, reason })
    }

    /// Release the shared engine.
    ///
    /// Fails with [`CoreError::Busy`] while any stream is active, so the
    /// engine is never unloaded underneath a delivery, and with
    /// [`CoreError::Unloaded`] if teardown already happened. Legal again
    /// once the active-stream counter is back to zero.
    pub async fn unload(&self) -> Result<(), CoreError> {
        {
            let mut unloaded = self.unloaded.lock();
            if *unloaded {
                return Err(CoreError::Unloaded);
            }

            let active = self.active_streams.load(Ordering::SeqCst);
            if active > 0 {
                return Err(CoreError::Busy { active });
            }

            *unloaded = true;
        }

        tracing::info!(engine = %self.engine.name(), "unload: releasing engine");
        self.engine.unload().await
    }

    /// Admit one stream, or refuse if the engine is gone.
    fn acquire(&self) -> Result<StreamSlot, CoreError> {
        let unloaded = self.unloaded.lock();
        if *unloaded {
            return Err(CoreError::Unloaded);
        }

        self.active_streams.fetch_add(1, Ordering::SeqCst);

        Ok(StreamSlot {
            counter: Arc::clone(&self.active_streams),
        })
    }
}

/// Map a terminal stream error message back onto the taxonomy, preserving
/// the message text either way.
fn stream_error(message: String) -> CoreError {
    if message == CANCELED_MSG || message == DEADLINE_MSG {
        CoreError::Cancelled(message)
    } else {
        CoreError::Engine(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TaskRunner;
    use crate::session::SessionStatus;
    use crate::store::{SessionStore, StoreConfig};
    use async_trait::async_trait;
    use std::time::Duration;

    /// How a scripted generation ends after its tokens run out
    #[derive(Clone)]
    enum ScriptEnd {
        /// Emit a normal stop delta and close
        Done,
        /// Emit an error delta and close
        Fail(String),
        /// Produce nothing more until the scope ends
        Hang,
    }

    /// Engine double that plays back a fixed script, honoring the scope the
    /// way a real engine must.
    struct ScriptedEngine {
        tokens: Vec<String>,
        token_delay: Duration,
        end: ScriptEnd,
    }

    impl ScriptedEngine {
        fn new(tokens: &[&str], end: ScriptEnd) -> Self {
            Self {
                tokens: tokens.iter().map(ToString::to_string).collect(),
                token_delay: Duration::ZERO,
                end,
            }
        }

        fn with_token_delay(mut self, delay: Duration) -> Self {
            self.token_delay = delay;
            self
        }
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            scope: ExecScope,
            _request: GenerateRequest,
        ) -> Result<mpsc::Receiver<ResponseDelta>, CoreError> {
            let (tx, rx) = mpsc::channel(1);
            let tokens = self.tokens.clone();
            let delay = self.token_delay;
            let end = self.end.clone();

            tokio::spawn(async move {
                for token in tokens {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    tokio::select! {
                        sent = tx.send(ResponseDelta::Token(token)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        scope_end = scope.cancelled() => {
                            let _ = tx.try_send(ResponseDelta::Error(
                                scope_end.message().to_string(),
                            ));
                            return;
                        }
                    }
                }

                match end {
                    ScriptEnd::Done => {
                        let _ = tx
                            .send(ResponseDelta::Done {
                                reason: StopReason::Stop,
                            })
                            .await;
                    }
                    ScriptEnd::Fail(message) => {
                        let _ = tx.send(ResponseDelta::Error(message)).await;
                    }
                    ScriptEnd::Hang => {
                        let scope_end = scope.cancelled().await;
                        let _ = tx.try_send(ResponseDelta::Error(
                            scope_end.message().to_string(),
                        ));
                    }
                }
            });

            Ok(rx)
        }

        async fn unload(&self) -> Result<(), CoreError> {
            Ok(())
        }
    }

    fn controller(engine: ScriptedEngine) -> StreamController {
        StreamController::new(Arc::new(engine))
    }

    /// Wait for the active-stream counter to drain, bounded.
    async fn wait_idle(controller: &StreamController) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while controller.active_streams() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "active-stream counter never returned to zero"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_stream_preserves_order_and_terminates_once() {
        let controller = controller(ScriptedEngine::new(&["a", "b", "c"], ScriptEnd::Done));
        let (scope, _handle) = ExecScope::new();

        let mut stream = controller
            .chat_streaming(scope, GenerateRequest::default())
            .await
            .expect("stream starts");

        let mut items = Vec::new();
        while let Some(delta) = stream.next().await {
            items.push(delta);
        }

        assert_eq!(
            items,
            vec![
                ResponseDelta::Token("a".into()),
                ResponseDelta::Token("b".into()),
                ResponseDelta::Token("c".into()),
                ResponseDelta::Done {
                    reason: StopReason::Stop
                },
            ]
        );

        wait_idle(&controller).await;
    }

    #[tokio::test]
    async fn test_chat_collects_tokens() {
        let controller = controller(ScriptedEngine::new(&["Go", "ril", "la"], ScriptEnd::Done));
        let (scope, _handle) = ExecScope::new();

        let outcome = controller
            .chat(scope, GenerateRequest::default())
            .await
            .expect("chat completes");

        assert_eq!(outcome.content, "Gorilla");
        assert_eq!(outcome.reason, StopReason::Stop);
    }

    #[tokio::test]
    async fn test_scope_already_ended_fails_before_delivery() {
        let controller = controller(ScriptedEngine::new(&["a"], ScriptEnd::Done));
        let (scope, handle) = ExecScope::new();
        handle.cancel();

        let err = controller
            .chat_streaming(scope, GenerateRequest::default())
            .await
            .expect_err("no stream for a dead scope");
        assert!(err.is_cancelled());
        assert_eq!(controller.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_consumption_yields_single_terminal_error() {
        let engine = ScriptedEngine::new(&["a", "b"], ScriptEnd::Done)
            .with_token_delay(Duration::from_millis(10));
        let controller = controller(engine);
        let (scope, handle) = ExecScope::new();

        let mut stream = controller
            .chat_streaming(scope, GenerateRequest::default())
            .await
            .expect("stream starts");

        handle.cancel();

        assert_eq!(
            stream.next().await,
            Some(ResponseDelta::Error("context canceled".into())),
            "exactly one terminal item, no content"
        );
        assert_eq!(stream.next().await, None);

        wait_idle(&controller).await;
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_delivered_items() {
        let engine = ScriptedEngine::new(
            &["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", "t8", "t9"],
            ScriptEnd::Done,
        )
        .with_token_delay(Duration::from_millis(5));
        let controller = controller(engine);
        let (scope, handle) = ExecScope::new();

        let mut stream = controller
            .chat_streaming(scope, GenerateRequest::default())
            .await
            .expect("stream starts");

        let mut delivered = Vec::new();
        for _ in 0..5 {
            match stream.next().await {
                Some(ResponseDelta::Token(text)) => delivered.push(text),
                other => panic!("expected a token, got {other:?}"),
            }
        }

        handle.cancel();

        assert_eq!(delivered, vec!["t0", "t1", "t2", "t3", "t4"]);
        assert_eq!(
            stream.next().await,
            Some(ResponseDelta::Error("context canceled".into()))
        );
        assert_eq!(stream.next().await, None, "nothing after the terminal item");

        wait_idle(&controller).await;
    }

    #[tokio::test]
    async fn test_abandonment_then_cancel_releases_the_stream() {
        let controller = controller(ScriptedEngine::new(&["a", "b"], ScriptEnd::Hang));
        let (scope, handle) = ExecScope::new();

        let mut stream = controller
            .chat_streaming(scope, GenerateRequest::default())
            .await
            .expect("stream starts");

        // Consume a little, then stop reading without cancelling.
        assert_eq!(stream.next().await, Some(ResponseDelta::Token("a".into())));

        // The stream is still open: teardown must refuse.
        let err = controller.unload().await.expect_err("stream is active");
        assert!(matches!(err, CoreError::Busy { active: 1 }));

        // Now the consumer's scope ends; nobody is reading, but the
        // producer must still close down within a bounded window.
        handle.cancel();
        wait_idle(&controller).await;

        // The abandoned sequence reports closed once polled again.
        assert_eq!(
            stream.next().await,
            Some(ResponseDelta::Error("context canceled".into()))
        );
        assert_eq!(stream.next().await, None);

        controller.unload().await.expect("idle engine unloads");
        let err = controller.unload().await.expect_err("double unload");
        assert!(matches!(err, CoreError::Unloaded));
    }

    #[tokio::test]
    async fn test_stream_after_unload_is_refused() {
        let controller = controller(ScriptedEngine::new(&[], ScriptEnd::Done));
        controller.unload().await.expect("unload idle engine");

        let (scope, _handle) = ExecScope::new();
        let err = controller
            .chat_streaming(scope, GenerateRequest::default())
            .await
            .expect_err("engine is gone");
        assert!(matches!(err, CoreError::Unloaded));
    }

    #[tokio::test]
    async fn test_engine_failure_surfaces_as_terminal_item() {
        let controller = controller(ScriptedEngine::new(
            &["partial"],
            ScriptEnd::Fail("kv cache exhausted".into()),
        ));
        let (scope, _handle) = ExecScope::new();

        let err = controller
            .chat(scope, GenerateRequest::default())
            .await
            .expect_err("engine failed");
        match err {
            CoreError::Engine(message) => assert_eq!(message, "kv cache exhausted"),
            other => panic!("expected engine error, got {other:?}"),
        }

        wait_idle(&controller).await;
    }

    #[tokio::test]
    async fn test_deadline_mid_stream_reports_deadline_exceeded() {
        let engine = ScriptedEngine::new(&["a", "b", "c", "d"], ScriptEnd::Done)
            .with_token_delay(Duration::from_millis(20));
        let controller = controller(engine);
        let (scope, _handle) = ExecScope::with_timeout(Duration::from_millis(50));

        let mut stream = controller
            .chat_streaming(scope, GenerateRequest::default())
            .await
            .expect("stream starts");

        let mut saw_terminal = None;
        while let Some(delta) = stream.next().await {
            if let ResponseDelta::Error(message) = delta {
                saw_terminal = Some(message);
            }
        }

        assert_eq!(saw_terminal, Some("deadline exceeded".to_string()));
        wait_idle(&controller).await;
    }

    #[tokio::test]
    async fn test_async_submission_composes_with_runner() {
        let controller = Arc::new(controller(ScriptedEngine::new(
            &["Hi", " there"],
            ScriptEnd::Done,
        )));
        let store = Arc::new(SessionStore::new(StoreConfig::default()));
        let runner = TaskRunner::new(store, Duration::from_secs(5));

        let task_controller = Arc::clone(&controller);
        let id = runner
            .run(move |scope, _id| async move {
                let outcome = task_controller
                    .chat(scope, GenerateRequest::new("hello", "scripted"))
                    .await?;
                Ok(outcome.content.into_bytes())
            })
            .expect("run");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let record = loop {
            let record = runner.session(id).expect("session present");
            if record.is_terminal() {
                break record;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never finished");
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.result, b"Hi there".to_vec());
        runner.shutdown().await;
    }
}
