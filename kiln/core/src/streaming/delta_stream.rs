//! Delta Stream Implementation
//!
//! An asynchronous stream of [`ResponseDelta`] items bridging a bounded
//! tokio channel to the `futures::Stream` interface, with the consumer-side
//! half of the cancellation contract built in.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::engine::ResponseDelta;
use crate::scope::{ExecScope, ScopeEnd};

/// An ordered, lazy sequence of response deltas.
///
/// The sequence terminates in exactly one terminal item: the engine's normal
/// stop delta, its error delta, or, if the caller's scope ends first, a
/// single `Error` delta carrying the cancellation message. After the
/// terminal item the stream only yields `None`.
///
/// Cancellation is checked before each item is handed out, so once the scope
/// ends no further content items are observed; items already consumed stand.
/// Deltas buffered but not yet consumed when cancellation takes effect are
/// discarded.
pub struct DeltaStream {
    receiver: mpsc::Receiver<ResponseDelta>,
    cancelled: Pin<Box<dyn Future<Output = ScopeEnd> + Send>>,
    terminated: bool,
}

impl std::fmt::Debug for DeltaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaStream")
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl DeltaStream {
    /// Wrap the forwarder's receiver, racing it against `scope`.
    pub(crate) fn new(receiver: mpsc::Receiver<ResponseDelta>, scope: ExecScope) -> Self {
        Self {
            receiver,
            cancelled: Box::pin(async move { scope.cancelled().await }),
            terminated: false,
        }
    }
}

impl Stream for DeltaStream {
    type Item = ResponseDelta;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.terminated {
            return Poll::Ready(None);
        }

        // The scope wins over anything still sitting in the channel.
        if let Poll::Ready(end) = this.cancelled.as_mut().poll(cx) {
            this.terminated = true;
            this.receiver.close();
            return Poll::Ready(Some(ResponseDelta::Error(end.message().to_string())));
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(delta)) => {
                if delta.is_terminal() {
                    this.terminated = true;
                }
                Poll::Ready(Some(delta))
            }
            Poll::Ready(None) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
