//! Ordering pipeline for one stream part.
//!
//! Raw messages go in through [`OrderMessages::add_message`] or
//! [`OrderMessages::add_messages`]; per-chain ordered messages come out of the
//! [`OrderedMessages`] stream returned by [`OrderMessages::new`].

use crate::chain::Gap;
use crate::config::OrderingConfig;
use crate::error::PipelineError;
use crate::fetch::RepairFetcher;
use crate::merge::{MergeBuffer, OrderedMessages};
use crate::message::{Message, StreamPartId};
use crate::monitor::OrderingMonitor;
use crate::registry::{ChainFactory, ChainRegistry};
use crate::resolver::{CachedReplicaResolver, ReplicaResolver};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Receives gaps that were given up on.
pub trait GapObserver: Send + Sync {
    fn on_unfillable_gap(&self, gap: &Gap);
}

/// Ignores every notification.
pub struct NoopObserver;

impl GapObserver for NoopObserver {
    fn on_unfillable_gap(&self, _gap: &Gap) {}
}

impl GapObserver for mpsc::UnboundedSender<Gap> {
    fn on_unfillable_gap(&self, gap: &Gap) {
        let _ = self.send(gap.clone());
    }
}

pub struct Collaborators {
    pub fetcher: Arc<dyn RepairFetcher>,
    pub resolver: Arc<dyn ReplicaResolver>,
    pub observer: Arc<dyn GapObserver>,
}

pub struct OrderMessages {
    stream_part: StreamPartId,
    config: OrderingConfig,
    registry: ChainRegistry,
    output: Arc<MergeBuffer>,
    monitor: Arc<OrderingMonitor>,
    cancel: CancellationToken,
}

impl OrderMessages {
    /// Must be called inside a tokio runtime; chains spawn their gap fillers.
    pub fn new(
        stream_part: StreamPartId,
        config: OrderingConfig,
        collaborators: Collaborators,
    ) -> (Self, OrderedMessages) {
        let cancel = CancellationToken::new();
        let monitor = Arc::new(OrderingMonitor::new());
        let (output, messages) = MergeBuffer::new(config.output_buffer_size, cancel.clone());
        let resolver = Arc::new(CachedReplicaResolver::new(
            collaborators.resolver,
            config.replica_cache_max_age(),
        ));

        let registry = ChainRegistry::new(ChainFactory {
            stream_part: stream_part.clone(),
            config: config.clone(),
            fetcher: collaborators.fetcher,
            resolver,
            observer: collaborators.observer,
            monitor: Arc::clone(&monitor),
            output: Arc::clone(&output),
            cancel: cancel.clone(),
        });

        let pipeline = Self { stream_part, config, registry, output, monitor, cancel };
        (pipeline, messages)
    }

    pub fn stream_part(&self) -> &StreamPartId {
        &self.stream_part
    }

    pub fn monitor(&self) -> Arc<OrderingMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Routes one raw message to its chain. Waits while the output buffer is full.
    pub async fn add_message(&self, msg: Message) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Destroyed);
        }
        self.monitor.record_received();
        if self.config.order_messages {
            self.registry.route(msg).await;
        } else {
            self.monitor.record_delivered(&msg.chain_key);
            self.output.push(msg).await;
        }
        Ok(())
    }

    /// Consumes the inbound feed. When it ends normally the output is closed
    /// once every chain is idle; when it fails the failure becomes the
    /// output's terminal item and all gap repairs are cancelled.
    pub async fn add_messages<S, E>(&self, src: S)
    where
        S: Stream<Item = Result<Message, E>>,
        E: Display,
    {
        futures::pin_mut!(src);
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                item = src.next() => item,
            };
            match item {
                Some(Ok(msg)) => {
                    if self.add_message(msg).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    error!(stream_part = %self.stream_part, error = %err, "inbound message feed failed");
                    self.fail(PipelineError::Upstream(err.to_string()));
                    return;
                }
                None => break,
            }
        }

        debug!(stream_part = %self.stream_part, chains = self.registry.len(), "inbound feed ended, waiting for open gaps");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            _ = self.registry.wait_until_idle() => {}
        }
        info!(stream_part = %self.stream_part, delivered = self.monitor.snapshot().delivered, "all chains idle, closing output");
        self.output.end(None);
        self.cancel.cancel();
    }

    /// Stops accepting input, cancels every in-flight gap repair and closes
    /// the output. Messages already buffered stay readable.
    pub fn destroy(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        debug!(stream_part = %self.stream_part, "destroying ordering pipeline");
        self.output.end(None);
        self.cancel.cancel();
    }

    /// Resolves when every gap filler task has exited.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
        self.registry.join_fillers().await;
    }

    fn fail(&self, err: PipelineError) {
        self.output.end(Some(err));
        self.cancel.cancel();
    }
}

impl Drop for OrderMessages {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
