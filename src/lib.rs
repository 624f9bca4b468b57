//! chain_order: per-chain ordering, deduplication and gap repair for messages
//! arriving over a lossy, reordering pub/sub overlay.
//!
//! # Usage
//! Build an [`OrderMessages`] pipeline for one stream part, feed it raw
//! messages and read the ordered output from the returned [`OrderedMessages`]
//! stream. Gaps are repaired from storage replicas through the injected
//! [`RepairFetcher`] and [`ReplicaResolver`].

pub mod message;
pub mod error;
pub mod config;
pub mod monitor;
pub mod chain;
pub mod fetch;
pub mod resolver;
pub mod gap_filler;
pub mod merge;
pub mod registry;
pub mod pipeline;
pub mod replica;

pub use chain::{ChainState, Gap, GapEvent, MessageChain};
pub use config::OrderingConfig;
pub use error::{FetchError, PipelineError};
pub use fetch::{MessageStream, RepairFetcher};
pub use merge::OrderedMessages;
pub use message::{ChainKey, Message, MessagePosition, RepairRequest, StreamPartId};
pub use monitor::{MonitorSnapshot, OrderingMonitor};
pub use pipeline::{Collaborators, GapObserver, NoopObserver, OrderMessages};
pub use replica::MemoryReplica;
pub use resolver::{CachedReplicaResolver, ReplicaResolver, StaticReplicas};
