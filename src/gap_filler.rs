//! Gap repair scheduling.
//!
//! Every chain gets one [`GapFiller`] task that listens to the chain's gap
//! events. Each opened gap runs its own repair task under a child of the
//! pipeline's cancellation token:
//!
//! 1. wait `initial_wait`
//! 2. ask a random replica for the missing range and feed the answer back
//! 3. retry after `retry_wait` until the gap closes or the budget is spent
//! 4. abandon the gap and report it to the [`GapObserver`]
//!
//! A gap that closes by any other path cancels its task immediately.

use crate::chain::{ChainHandle, Gap, GapEvent};
use crate::error::FetchError;
use crate::fetch::RepairFetcher;
use crate::message::{RepairRequest, StreamPartId};
use crate::monitor::OrderingMonitor;
use crate::pipeline::GapObserver;
use crate::resolver::CachedReplicaResolver;
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a repair task needs, shared by all gaps of one chain.
pub struct GapFillContext {
    pub stream_part: StreamPartId,
    pub chain: Arc<ChainHandle>,
    pub fetcher: Arc<dyn RepairFetcher>,
    pub resolver: Arc<CachedReplicaResolver>,
    pub observer: Arc<dyn GapObserver>,
    pub monitor: Arc<OrderingMonitor>,
    pub initial_wait: Duration,
    pub retry_wait: Duration,
    pub max_requests: u32,
}

/// Fetched messages already available are handed to the chain together.
const REINJECT_BATCH: usize = 64;

#[derive(Debug, PartialEq, Eq)]
enum RepairOutcome {
    Filled,
    Exhausted,
    Cancelled,
}

pub struct GapFiller {
    ctx: Arc<GapFillContext>,
    cancel: CancellationToken,
}

impl GapFiller {
    pub fn new(ctx: GapFillContext, cancel: CancellationToken) -> Self {
        Self { ctx: Arc::new(ctx), cancel }
    }

    pub fn spawn(self, gap_rx: mpsc::UnboundedReceiver<GapEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(gap_rx))
    }

    async fn run(self, mut gap_rx: mpsc::UnboundedReceiver<GapEvent>) {
        let mut current: Option<(u64, CancellationToken)> = None;
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = gap_rx.recv() => match event {
                    Some(GapEvent::Opened(gap)) => {
                        if let Some((_, token)) = current.take() {
                            token.cancel();
                        }
                        let token = self.cancel.child_token();
                        current = Some((gap.id, token.clone()));
                        tasks.spawn(fill_gap(Arc::clone(&self.ctx), gap, token));
                    }
                    Some(GapEvent::Resolved(id)) => close(&mut current, id),
                    Some(GapEvent::Abandoned(gap)) => close(&mut current, gap.id),
                    None => break,
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        if let Some((_, token)) = current.take() {
            token.cancel();
        }
        tasks.shutdown().await;
    }
}

fn close(current: &mut Option<(u64, CancellationToken)>, gap_id: u64) {
    if matches!(current, Some((id, _)) if *id == gap_id) {
        if let Some((_, token)) = current.take() {
            token.cancel();
        }
    }
}

async fn fill_gap(ctx: Arc<GapFillContext>, gap: Gap, token: CancellationToken) {
    if !sleep_or_cancel(ctx.initial_wait, &token).await {
        return;
    }
    // a bootstrap gap has no anchored lower bound to ask storage for
    if !gap.is_bootstrap() && ctx.max_requests > 0 {
        match ctx.repair(gap.id, &token).await {
            RepairOutcome::Filled | RepairOutcome::Cancelled => return,
            RepairOutcome::Exhausted => {}
        }
    }
    if token.is_cancelled() {
        return;
    }
    ctx.give_up(gap.id).await;
}

async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl GapFillContext {
    async fn current_gap(&self, gap_id: u64) -> Option<Gap> {
        self.chain.open_gap().await.filter(|g| g.id == gap_id)
    }

    async fn repair(&self, gap_id: u64, token: &CancellationToken) -> RepairOutcome {
        for attempt in 1..=self.max_requests {
            // re-read: the gap's upper bound moves back when earlier messages get buffered
            let Some(gap) = self.current_gap(gap_id).await else {
                return RepairOutcome::Filled;
            };
            match self.request(&gap, token).await {
                Ok(recovered) => {
                    debug!(chain = %gap.chain_key, gap = gap_id, attempt, recovered, "repair request answered");
                }
                Err(FetchError::Cancelled) => return RepairOutcome::Cancelled,
                Err(FetchError::NoReplicas(stream)) => {
                    debug!(chain = %gap.chain_key, gap = gap_id, stream = %stream, "no storage replicas to ask");
                    return RepairOutcome::Exhausted;
                }
                Err(err) => {
                    debug!(chain = %gap.chain_key, gap = gap_id, attempt, error = %err, "Unable to fill gap");
                }
            }
            if self.current_gap(gap_id).await.is_none() {
                return RepairOutcome::Filled;
            }
            if attempt < self.max_requests && !sleep_or_cancel(self.retry_wait, token).await {
                return RepairOutcome::Cancelled;
            }
        }
        RepairOutcome::Exhausted
    }

    async fn request(&self, gap: &Gap, token: &CancellationToken) -> Result<u64, FetchError> {
        let Some((from, to)) = gap.missing_range() else {
            return Ok(0);
        };
        let stream_id = &self.stream_part.stream_id;
        let replicas = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            resolved = self.resolver.get(stream_id) => resolved,
        };
        let replicas = match replicas {
            Ok(replicas) => replicas,
            Err(err) => {
                self.monitor.record_resolve_failure();
                return Err(err);
            }
        };
        let replica = {
            let mut rng = rand::thread_rng();
            replicas.choose(&mut rng).cloned()
        };
        let Some(replica) = replica else {
            return Err(FetchError::NoReplicas(stream_id.clone()));
        };

        let request = RepairRequest {
            stream_part: self.stream_part.clone(),
            chain_key: gap.chain_key.clone(),
            from,
            to,
        };
        debug!(chain = %gap.chain_key, gap = gap.id, %from, %to, replica = %replica, "requesting missing messages");
        let result = self.stream_into_chain(request, replica, token).await;
        match &result {
            Ok(recovered) => self.monitor.record_fetch(*recovered, false),
            Err(FetchError::Cancelled) => {}
            Err(_) => self.monitor.record_fetch(0, true),
        }
        result
    }

    async fn stream_into_chain(
        &self,
        request: RepairRequest,
        replica: String,
        token: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let messages = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            stream = self.fetcher.fetch(request.clone(), replica, token.clone()) => stream?,
        };

        let mut batches = messages.ready_chunks(REINJECT_BATCH);
        let mut recovered = 0;
        loop {
            let batch = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FetchError::Cancelled),
                batch = batches.next() => batch,
            };
            let Some(batch) = batch else {
                return Ok(recovered);
            };

            let mut repaired = Vec::with_capacity(batch.len());
            let mut failure = None;
            for item in batch {
                match item {
                    Ok(msg) if request.contains(&msg) => repaired.push(msg),
                    Ok(msg) => {
                        debug!(chain = %request.chain_key, position = %msg.position, "ignoring message outside the requested range");
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            recovered += repaired.len() as u64;
            self.chain.reinject_repaired(repaired).await;
            if let Some(err) = failure {
                return Err(err);
            }
        }
    }

    async fn give_up(&self, gap_id: u64) {
        let Some(gap) = self.chain.abandon_gap(gap_id).await else {
            return;
        };
        if gap.is_bootstrap() {
            debug!(chain = %gap.chain_key, position = %gap.to.position, "anchoring chain at first held-back message");
            return;
        }
        warn!(
            chain = %gap.chain_key,
            from = ?gap.from,
            to = %gap.to.position,
            "unfillable gap, skipping missing messages"
        );
        self.observer.on_unfillable_gap(&gap);
    }
}
