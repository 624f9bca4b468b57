use crate::chain::ChainHandle;
use crate::config::OrderingConfig;
use crate::fetch::RepairFetcher;
use crate::gap_filler::{GapFillContext, GapFiller};
use crate::merge::MergeBuffer;
use crate::message::{ChainKey, Message, StreamPartId};
use crate::monitor::OrderingMonitor;
use crate::pipeline::GapObserver;
use crate::resolver::CachedReplicaResolver;
use dashmap::DashMap;
use fxhash::FxBuildHasher;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Collaborators handed to every chain's gap filler.
#[derive(Clone)]
pub struct ChainFactory {
    pub stream_part: StreamPartId,
    pub config: OrderingConfig,
    pub fetcher: Arc<dyn RepairFetcher>,
    pub resolver: Arc<CachedReplicaResolver>,
    pub observer: Arc<dyn GapObserver>,
    pub monitor: Arc<OrderingMonitor>,
    pub output: Arc<MergeBuffer>,
    pub cancel: CancellationToken,
}

/// One chain per [`ChainKey`], created on first use.
pub struct ChainRegistry {
    factory: ChainFactory,
    chains: DashMap<ChainKey, Arc<ChainHandle>, FxBuildHasher>,
    fillers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChainRegistry {
    pub fn new(factory: ChainFactory) -> Self {
        Self {
            factory,
            chains: DashMap::with_hasher(FxBuildHasher::default()),
            fillers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the chain for `key`, creating it if needed. Construction runs
    /// under the map's entry lock, so racing first arrivals share one chain.
    pub fn get(&self, key: &ChainKey) -> Arc<ChainHandle> {
        if let Some(chain) = self.chains.get(key) {
            return Arc::clone(chain.value());
        }
        let entry = self
            .chains
            .entry(key.clone())
            .or_insert_with(|| self.create_chain(key));
        Arc::clone(entry.value())
    }

    pub async fn route(&self, msg: Message) {
        let chain = self.get(&msg.chain_key);
        chain.add_message(msg).await;
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn keys(&self) -> Vec<ChainKey> {
        let mut keys: Vec<_> = self.chains.iter().map(|kv| kv.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Resolves once no chain has an open gap.
    pub async fn wait_until_idle(&self) {
        let chains: Vec<_> = self.chains.iter().map(|kv| Arc::clone(kv.value())).collect();
        for chain in chains {
            chain.wait_until_idle().await;
        }
    }

    /// Waits for every gap filler task to exit. They exit once the pipeline's
    /// cancellation token fires.
    pub async fn join_fillers(&self) {
        let handles: Vec<_> = {
            let mut fillers = self.fillers.lock().unwrap_or_else(|p| p.into_inner());
            fillers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn create_chain(&self, key: &ChainKey) -> Arc<ChainHandle> {
        let f = &self.factory;
        let (gap_tx, gap_rx) = mpsc::unbounded_channel();
        let chain = Arc::new(ChainHandle::new(
            key.clone(),
            Arc::clone(&f.output),
            gap_tx,
            Arc::clone(&f.monitor),
        ));

        let filler = GapFiller::new(
            GapFillContext {
                stream_part: f.stream_part.clone(),
                chain: Arc::clone(&chain),
                fetcher: Arc::clone(&f.fetcher),
                resolver: Arc::clone(&f.resolver),
                observer: Arc::clone(&f.observer),
                monitor: Arc::clone(&f.monitor),
                initial_wait: f.config.initial_wait(),
                retry_wait: f.config.retry_wait(),
                max_requests: f.config.effective_max_requests(),
            },
            f.cancel.clone(),
        );
        let handle = filler.spawn(gap_rx);
        self.fillers.lock().unwrap_or_else(|p| p.into_inner()).push(handle);

        debug!(stream_part = %f.stream_part, chain = %key, "created message chain");
        chain
    }
}
