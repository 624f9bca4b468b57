//! Per-chain ordering state.
//!
//! [`MessageChain`] is the synchronous state machine: it orders, deduplicates
//! and detects gaps for one [`ChainKey`]. [`ChainHandle`] serializes access to
//! it and publishes what it produces: ordered messages go to the shared
//! [`MergeBuffer`], gap notifications go to the chain's gap event channel.

use crate::merge::MergeBuffer;
use crate::message::{ChainKey, Message, MessagePosition};
use crate::monitor::OrderingMonitor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    AwaitingRepair,
}

/// Hole between the last delivered position and the earliest held-back message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gap {
    /// Unique per chain. Used to tell a still-open gap from a newer one.
    pub id: u64,
    pub chain_key: ChainKey,
    /// Last delivered position (exclusive). `None` on a chain that has not
    /// delivered anything yet.
    pub from: Option<MessagePosition>,
    /// Earliest held-back message whose predecessor is missing.
    pub to: Message,
}

impl Gap {
    /// Inclusive range of positions that would close this gap.
    /// `None` when the gap has no anchored lower bound.
    pub fn missing_range(&self) -> Option<(MessagePosition, MessagePosition)> {
        let from = self.from?;
        let to = self.to.previous_position?;
        Some((from.next(), to))
    }

    pub fn is_bootstrap(&self) -> bool {
        self.from.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GapEvent {
    Opened(Gap),
    Resolved(u64),
    Abandoned(Gap),
}

/// Everything one state machine call produced.
#[derive(Debug, Default)]
pub struct ChainOutput {
    pub delivered: Vec<Message>,
    pub events: Vec<GapEvent>,
    pub duplicate: bool,
}

#[derive(Debug)]
pub struct MessageChain {
    key: ChainKey,
    last_delivered: Option<MessagePosition>,
    // keyed by previous_position
    buffered: BTreeMap<MessagePosition, Message>,
    open_gap: Option<Gap>,
    next_gap_id: u64,
}

impl MessageChain {
    pub fn new(key: ChainKey) -> Self {
        Self {
            key,
            last_delivered: None,
            buffered: BTreeMap::new(),
            open_gap: None,
            next_gap_id: 0,
        }
    }

    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    pub fn state(&self) -> ChainState {
        if self.open_gap.is_some() { ChainState::AwaitingRepair } else { ChainState::Idle }
    }

    pub fn last_delivered(&self) -> Option<MessagePosition> {
        self.last_delivered
    }

    pub fn open_gap(&self) -> Option<&Gap> {
        self.open_gap.as_ref()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn add_message(&mut self, msg: Message) -> ChainOutput {
        let mut out = ChainOutput::default();
        self.push(msg, &mut out);
        self.refresh_gap(&mut out);
        out
    }

    /// Feeds historical messages in position order.
    pub fn reinject_repaired(&mut self, mut msgs: Vec<Message>) -> ChainOutput {
        msgs.sort_by_key(|m| m.position);
        let mut out = ChainOutput::default();
        for msg in msgs {
            self.push(msg, &mut out);
        }
        self.refresh_gap(&mut out);
        // a single stale message in a batch does not make the batch a duplicate
        out.duplicate = out.duplicate && out.delivered.is_empty();
        out
    }

    /// Gives up on the open gap with the given id: the earliest held-back
    /// message is delivered as if its predecessor had arrived. Returns the
    /// abandoned gap, or `None` when that gap is no longer open.
    pub fn abandon_gap(&mut self, gap_id: u64) -> Option<(Gap, ChainOutput)> {
        let gap = match &self.open_gap {
            Some(g) if g.id == gap_id => g.clone(),
            _ => return None,
        };
        self.open_gap = None;

        let mut out = ChainOutput::default();
        if let Some(prev) = self.earliest_buffered() {
            if let Some(msg) = self.buffered.remove(&prev) {
                self.deliver(msg, &mut out);
                self.flush_buffered(&mut out);
            }
        }
        out.events.push(GapEvent::Abandoned(gap.clone()));
        self.refresh_gap(&mut out);
        Some((gap, out))
    }

    fn push(&mut self, msg: Message, out: &mut ChainOutput) {
        if self.is_stale(&msg) {
            out.duplicate = true;
            return;
        }
        match msg.previous_position {
            Some(prev) if !self.is_next(&msg) => {
                if self.buffered.contains_key(&prev) {
                    out.duplicate = true;
                    return;
                }
                debug!(chain = %self.key, position = %msg.position, previous = %prev, "buffering out-of-order message");
                self.buffered.insert(prev, msg);
            }
            _ => {
                self.deliver(msg, out);
                self.flush_buffered(out);
            }
        }
    }

    fn is_stale(&self, msg: &Message) -> bool {
        self.last_delivered.map_or(false, |last| msg.position <= last)
    }

    fn is_next(&self, msg: &Message) -> bool {
        match (self.last_delivered, msg.previous_position) {
            // chain start, or a publisher restarting its chain
            (_, None) => true,
            (Some(last), Some(prev)) => prev == last,
            (None, Some(_)) => false,
        }
    }

    fn deliver(&mut self, msg: Message, out: &mut ChainOutput) {
        self.last_delivered = Some(msg.position);
        out.delivered.push(msg);
    }

    fn flush_buffered(&mut self, out: &mut ChainOutput) {
        while let Some(last) = self.last_delivered {
            match self.buffered.remove(&last) {
                Some(msg) => self.deliver(msg, out),
                None => break,
            }
        }
        if let Some(last) = self.last_delivered {
            self.buffered.retain(|_, m| m.position > last);
        }
    }

    fn earliest_buffered(&self) -> Option<MessagePosition> {
        self.buffered
            .iter()
            .min_by_key(|(_, m)| m.position)
            .map(|(prev, _)| *prev)
    }

    fn refresh_gap(&mut self, out: &mut ChainOutput) {
        let earliest = self
            .earliest_buffered()
            .and_then(|prev| self.buffered.get(&prev))
            .cloned();

        match (self.open_gap.take(), earliest) {
            (None, None) => {}
            (None, Some(to)) => self.open(to, out),
            (Some(gap), None) => out.events.push(GapEvent::Resolved(gap.id)),
            (Some(gap), Some(to)) if gap.from != self.last_delivered => {
                // the old hole was filled but another one remains further ahead
                out.events.push(GapEvent::Resolved(gap.id));
                self.open(to, out);
            }
            (Some(mut gap), Some(to)) => {
                if to.position < gap.to.position {
                    gap.to = to;
                }
                self.open_gap = Some(gap);
            }
        }
    }

    fn open(&mut self, to: Message, out: &mut ChainOutput) {
        let gap = Gap {
            id: self.next_gap_id,
            chain_key: self.key.clone(),
            from: self.last_delivered,
            to,
        };
        self.next_gap_id += 1;
        debug!(chain = %self.key, gap = gap.id, to = %gap.to.position, "gap opened");
        out.events.push(GapEvent::Opened(gap.clone()));
        self.open_gap = Some(gap);
    }
}

/// Serialized access to one [`MessageChain`]. The lock is held while ordered
/// messages are handed to the merge buffer so that concurrent callers (the
/// inbound router and the repair task) can never interleave a chain's output.
pub struct ChainHandle {
    chain: Mutex<MessageChain>,
    output: Arc<MergeBuffer>,
    gap_tx: mpsc::UnboundedSender<GapEvent>,
    idle_tx: watch::Sender<bool>,
    monitor: Arc<OrderingMonitor>,
}

impl ChainHandle {
    pub fn new(
        key: ChainKey,
        output: Arc<MergeBuffer>,
        gap_tx: mpsc::UnboundedSender<GapEvent>,
        monitor: Arc<OrderingMonitor>,
    ) -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            chain: Mutex::new(MessageChain::new(key)),
            output,
            gap_tx,
            idle_tx,
            monitor,
        }
    }

    pub async fn add_message(&self, msg: Message) {
        let mut chain = self.chain.lock().await;
        let out = chain.add_message(msg);
        self.publish(&chain, out).await;
    }

    pub async fn reinject_repaired(&self, msgs: Vec<Message>) {
        if msgs.is_empty() {
            return;
        }
        let mut chain = self.chain.lock().await;
        let out = chain.reinject_repaired(msgs);
        self.publish(&chain, out).await;
    }

    pub async fn abandon_gap(&self, gap_id: u64) -> Option<Gap> {
        let mut chain = self.chain.lock().await;
        let (gap, out) = chain.abandon_gap(gap_id)?;
        self.publish(&chain, out).await;
        Some(gap)
    }

    pub async fn open_gap(&self) -> Option<Gap> {
        self.chain.lock().await.open_gap().cloned()
    }

    pub async fn state(&self) -> ChainState {
        self.chain.lock().await.state()
    }

    pub async fn last_delivered(&self) -> Option<MessagePosition> {
        self.chain.lock().await.last_delivered()
    }

    /// Resolves once the chain has no open gap.
    pub async fn wait_until_idle(&self) {
        let mut idle_rx = self.idle_tx.subscribe();
        // the sender lives in self, so the channel cannot close underneath us
        let _ = idle_rx.wait_for(|idle| *idle).await;
    }

    async fn publish(&self, chain: &MessageChain, out: ChainOutput) {
        if out.duplicate {
            self.monitor.record_duplicate();
        }
        for msg in out.delivered {
            self.monitor.record_delivered(&msg.chain_key);
            self.output.push(msg).await;
        }
        for event in out.events {
            self.monitor.record_gap_event(&event);
            // the gap filler only goes away on pipeline shutdown
            let _ = self.gap_tx.send(event);
        }
        self.idle_tx.send_replace(chain.open_gap().is_none());
    }
}
