//! In-memory storage replica, used by the simulator and the tests.

use crate::error::FetchError;
use crate::fetch::{MessageStream, RepairFetcher};
use crate::message::{ChainKey, Message, MessagePosition, RepairRequest};
use crate::resolver::ReplicaResolver;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemoryReplica {
    name: String,
    chains: DashMap<ChainKey, BTreeMap<MessagePosition, Message>>,
    requests: Mutex<Vec<RepairRequest>>,
    failures_left: AtomicU32,
}

impl MemoryReplica {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self, msg: Message) {
        self.chains
            .entry(msg.chain_key.clone())
            .or_default()
            .insert(msg.position, msg);
    }

    /// The next `count` fetches fail as if the replica were unreachable.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RepairRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn range(&self, request: &RepairRequest) -> Vec<Message> {
        match self.chains.get(&request.chain_key) {
            Some(chain) => chain
                .range(request.from..=request.to)
                .map(|(_, msg)| msg.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RepairFetcher for MemoryReplica {
    async fn fetch(
        &self,
        request: RepairRequest,
        replica: String,
        _cancel: CancellationToken,
    ) -> Result<MessageStream, FetchError> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).push(request.clone());
        if self.take_failure() {
            return Err(FetchError::Unreachable { replica, reason: "connection refused".to_string() });
        }
        let msgs: Vec<Result<Message, FetchError>> = if request.from <= request.to {
            self.range(&request).into_iter().map(Ok).collect()
        } else {
            Vec::new()
        };
        Ok(Box::pin(futures::stream::iter(msgs)))
    }
}

#[async_trait]
impl ReplicaResolver for MemoryReplica {
    async fn resolve_replicas(&self, _stream_id: &str) -> Result<Vec<String>, FetchError> {
        Ok(vec![self.name.clone()])
    }
}
