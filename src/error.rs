use thiserror::Error;

/// Failure of a single repair request. Every variant except `Cancelled`
/// consumes one attempt of the gap's retry budget.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("replica {replica} unreachable: {reason}")]
    Unreachable { replica: String, reason: String },
    #[error("no storage replicas known for stream {0}")]
    NoReplicas(String),
    #[error("replica resolution failed for stream {stream_id}: {reason}")]
    Resolve { stream_id: String, reason: String },
    #[error("repair request cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("inbound message feed failed: {0}")]
    Upstream(String),
    #[error("pipeline destroyed")]
    Destroyed,
}
