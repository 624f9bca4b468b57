use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one partition of a stream. A pipeline orders the messages of a
/// single stream part.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPartId {
    pub stream_id: String,
    pub partition: u32,
}

impl StreamPartId {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self { stream_id: stream_id.into(), partition }
    }
}

impl fmt::Display for StreamPartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.partition)
    }
}

/// (publisher, chain) pair. Every chain is ordered independently.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub publisher_id: String,
    pub chain_id: String,
}

impl ChainKey {
    pub fn new(publisher_id: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self { publisher_id: publisher_id.into(), chain_id: chain_id.into() }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.publisher_id, self.chain_id)
    }
}

/// Sortable position of a message inside its chain. Ordered by timestamp,
/// then by sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessagePosition {
    pub timestamp: i64,
    pub sequence_number: u32,
}

impl MessagePosition {
    pub const fn new(timestamp: i64, sequence_number: u32) -> Self {
        Self { timestamp, sequence_number }
    }

    /// Smallest position strictly after this one with the same timestamp.
    pub fn next(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            sequence_number: self.sequence_number.saturating_add(1),
        }
    }
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.timestamp, self.sequence_number)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub chain_key: ChainKey,
    pub position: MessagePosition,
    /// Position of the chain predecessor, `None` for the first message of a chain.
    pub previous_position: Option<MessagePosition>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(
        chain_key: ChainKey,
        position: MessagePosition,
        previous_position: Option<MessagePosition>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self { chain_key, position, previous_position, payload: payload.into() }
    }
}

/// Range query sent to a storage replica. Both bounds are inclusive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub stream_part: StreamPartId,
    pub chain_key: ChainKey,
    pub from: MessagePosition,
    pub to: MessagePosition,
}

impl RepairRequest {
    pub fn contains(&self, msg: &Message) -> bool {
        msg.chain_key == self.chain_key && msg.position >= self.from && msg.position <= self.to
    }
}
