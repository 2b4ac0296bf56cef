//! Partitioned log broker abstraction
//!
//! The engine never talks to a concrete broker client directly. Everything it
//! needs is behind the `LogBroker` trait: produce-to-partition with headers,
//! consumer-group membership with a pluggable assignment callback, offset
//! queries, and administrative topic/partition/record management. This keeps
//! the routing and recovery logic testable against the in-memory broker in
//! [`memory`].

pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::Result;

pub use memory::MemoryBroker;

/// A record as produced to / consumed from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Optional record key (used for log inspection and compaction)
    pub key: Option<Vec<u8>>,
    /// Raw application payload bytes
    pub value: Vec<u8>,
    /// String-keyed metadata headers
    pub headers: Vec<RecordHeader>,
    /// Timestamp (milliseconds since epoch, optional)
    pub timestamp: Option<i64>,
}

/// Record header (key-value metadata)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Vec<u8>,
}

/// A record read from a specific partition, with its offset.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub partition: i32,
    pub offset: i64,
    pub record: Record,
}

/// Oldest/newest offsets of one partition. `oldest == newest` means empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionOffsets {
    pub oldest: i64,
    pub newest: i64,
}

impl PartitionOffsets {
    pub fn is_empty(&self) -> bool {
        self.newest <= self.oldest
    }
}

/// Opaque consumer-group member identity assigned by the broker.
pub type MemberId = String;

/// Per-member output of the assignment callback: the partitions the member
/// must consume this generation, plus opaque data broadcast to it (the
/// engine uses this to ship the routing snapshot and dirty flag).
#[derive(Debug, Clone, Default)]
pub struct MemberAssignment {
    pub partitions: Vec<i32>,
    pub data: Vec<u8>,
}

/// The broker-invoked partition assignment decision.
///
/// Called on every group membership change with each member's advertised
/// metadata and per-partition offset bounds. Returning an error marks the
/// generation as failed and the broker retries; the engine's implementation
/// uses this for the transient too-few-partitions condition after growing
/// the topic administratively.
#[async_trait]
pub trait AssignmentCallback: Send + Sync {
    async fn assign(
        &self,
        members: &BTreeMap<MemberId, Vec<u8>>,
        partitions: &[i32],
        offsets: &HashMap<i32, PartitionOffsets>,
    ) -> Result<HashMap<MemberId, MemberAssignment>>;
}

/// Events delivered to a group member across rebalances.
#[derive(Debug)]
pub enum GroupEvent {
    /// Previous assignment is void; stop consuming.
    Revoked,
    /// New generation: consume the given partitions. Each receiver starts
    /// with the partition's full unconsumed backlog, then follows new
    /// produces.
    Assigned {
        generation: u64,
        partitions: Vec<i32>,
        data: Vec<u8>,
        channels: HashMap<i32, mpsc::UnboundedReceiver<ConsumedRecord>>,
    },
}

/// Member-side control handle for a joined group.
pub trait GroupControl: Send + Sync {
    /// Replace the metadata advertised at the next rebalance. Passive: does
    /// not itself trigger one.
    fn update_metadata(&self, metadata: Vec<u8>);
    /// Force a new generation (used after a recovery pass completes).
    fn rejoin(&self);
    /// Leave the group, triggering a rebalance for the survivors.
    fn leave(&self);
}

/// A live consumer-group membership.
pub struct GroupSession {
    pub member_id: MemberId,
    pub events: mpsc::UnboundedReceiver<GroupEvent>,
    pub control: Arc<dyn GroupControl>,
}

/// Minimal partitioned log broker interface.
#[async_trait]
pub trait LogBroker: Send + Sync {
    /// Create a topic if absent. Fails when the requested replication factor
    /// cannot be satisfied by the cluster.
    async fn create_topic(&self, topic: &str, partitions: i32, replication: i16) -> Result<()>;

    /// Grow the topic to at least `total` partitions.
    async fn add_partitions(&self, topic: &str, total: i32) -> Result<()>;

    /// All partition ids of the topic, ascending.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// Oldest/newest offsets of one partition.
    async fn offsets(&self, topic: &str, partition: i32) -> Result<PartitionOffsets>;

    /// Append a record to a specific partition, returning its offset.
    async fn produce(&self, topic: &str, partition: i32, record: Record) -> Result<i64>;

    /// Physically delete records with offset < `before`. Partition 0 is
    /// never passed here by the engine.
    async fn delete_records(&self, topic: &str, partition: i32, before: i64) -> Result<()>;

    /// Join the topic's consumer group with the given advertised metadata
    /// and assignment callback.
    async fn join_group(
        &self,
        topic: &str,
        metadata: Vec<u8>,
        callback: Arc<dyn AssignmentCallback>,
    ) -> Result<GroupSession>;
}
