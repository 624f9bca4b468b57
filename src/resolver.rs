use crate::error::FetchError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Looks up the storage replicas holding history for a stream.
#[async_trait]
pub trait ReplicaResolver: Send + Sync {
    async fn resolve_replicas(&self, stream_id: &str) -> Result<Vec<String>, FetchError>;
}

/// Fixed replica list, the same for every stream.
#[derive(Clone, Debug, Default)]
pub struct StaticReplicas {
    replicas: Vec<String>,
}

impl StaticReplicas {
    pub fn new<I, S>(replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { replicas: replicas.into_iter().map(Into::into).collect() }
    }
}

#[async_trait]
impl ReplicaResolver for StaticReplicas {
    async fn resolve_replicas(&self, _stream_id: &str) -> Result<Vec<String>, FetchError> {
        Ok(self.replicas.clone())
    }
}

/// Caches successful resolutions per stream for `max_age`.
///
/// Lookups for the same cache are single-flight: the lock is held across the
/// inner call, so concurrent gaps trigger at most one resolution. Failures are
/// not cached.
pub struct CachedReplicaResolver {
    inner: Arc<dyn ReplicaResolver>,
    max_age: Duration,
    entries: Mutex<HashMap<String, (Instant, Arc<Vec<String>>)>>,
}

impl CachedReplicaResolver {
    pub fn new(inner: Arc<dyn ReplicaResolver>, max_age: Duration) -> Self {
        Self { inner, max_age, entries: Mutex::new(HashMap::new()) }
    }

    pub async fn get(&self, stream_id: &str) -> Result<Arc<Vec<String>>, FetchError> {
        let mut entries = self.entries.lock().await;
        if let Some((resolved_at, replicas)) = entries.get(stream_id) {
            if resolved_at.elapsed() < self.max_age {
                return Ok(Arc::clone(replicas));
            }
        }
        let replicas = Arc::new(self.inner.resolve_replicas(stream_id).await?);
        debug!(stream = stream_id, count = replicas.len(), "resolved storage replicas");
        entries.insert(stream_id.to_string(), (Instant::now(), Arc::clone(&replicas)));
        Ok(replicas)
    }
}

#[async_trait]
impl ReplicaResolver for CachedReplicaResolver {
    async fn resolve_replicas(&self, stream_id: &str) -> Result<Vec<String>, FetchError> {
        Ok(self.get(stream_id).await?.as_ref().clone())
    }
}
