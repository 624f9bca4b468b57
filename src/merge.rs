//! Fan-in of every chain's ordered output into one consumer-facing stream.

use crate::error::PipelineError;
use crate::message::Message;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Bounded fan-in buffer. Pushers wait while the consumer lags behind, which
/// is how backpressure reaches the inbound feed and the repair tasks.
pub struct MergeBuffer {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    terminal: Arc<Mutex<Option<PipelineError>>>,
    cancel: CancellationToken,
}

impl MergeBuffer {
    pub fn new(capacity: usize, cancel: CancellationToken) -> (Arc<Self>, OrderedMessages) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let terminal = Arc::new(Mutex::new(None));
        let buffer = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            terminal: Arc::clone(&terminal),
            cancel,
        });
        let stream = OrderedMessages {
            rx: ReceiverStream::new(rx),
            terminal,
            finished: false,
        };
        (buffer, stream)
    }

    /// Hands one ordered message to the consumer. Returns `false` when the
    /// output has already ended and the message was discarded.
    pub async fn push(&self, msg: Message) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = tx.send(msg) => sent.is_ok(),
        }
    }

    /// Stops accepting messages. Items already buffered stay readable; the
    /// error, if any, is yielded once after them.
    pub fn end(&self, error: Option<PipelineError>) {
        let Some(tx) = lock(&self.tx).take() else {
            return;
        };
        if let Some(err) = error {
            *lock(&self.terminal) = Some(err);
        }
        drop(tx);
    }

    fn sender(&self) -> Option<mpsc::Sender<Message>> {
        lock(&self.tx).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered messages of every chain of the stream part. Ends after the
/// pipeline is destroyed or the inbound feed is exhausted; a fatal upstream
/// failure is reported as the final `Err` item.
pub struct OrderedMessages {
    rx: ReceiverStream<Message>,
    terminal: Arc<Mutex<Option<PipelineError>>>,
    finished: bool,
}

impl Stream for OrderedMessages {
    type Item = Result<Message, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Ready(Some(msg)) => Poll::Ready(Some(Ok(msg))),
            Poll::Ready(None) => {
                self.finished = true;
                let terminal = lock(&self.terminal).take();
                Poll::Ready(terminal.map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
