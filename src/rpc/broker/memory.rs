//! In-memory partitioned log broker
//!
//! A complete single-process implementation of [`LogBroker`], including
//! consumer-group membership and the assignment-callback protocol. Multiple
//! engines sharing one `MemoryBroker` behave like sidecars sharing a real
//! broker, which is what lets the recovery and rebalance paths be exercised
//! without external infrastructure.
//!
//! ## Rebalance protocol
//!
//! Membership changes (join, leave, kill, explicit rejoin) schedule a
//! rebalance task. The task snapshots members/partitions/offsets, revokes
//! all owners, runs the group's assignment callback outside the state lock,
//! and applies the result only if membership did not change in the meantime.
//! A failed callback (e.g. too few partitions) is retried with a fresh
//! snapshot, which is how administrative partition growth takes effect on
//! the next attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::rpc::error::{Result, RpcError};

use super::{
    AssignmentCallback, ConsumedRecord, GroupControl, GroupEvent, GroupSession, LogBroker,
    MemberId, PartitionOffsets, Record,
};

/// Attempts per rebalance before giving up until the next membership change.
const MAX_ASSIGN_ATTEMPTS: u32 = 16;

/// Delay between failed assignment attempts.
const ASSIGN_RETRY_DELAY: Duration = Duration::from_millis(20);

struct PartitionLog {
    /// Offset of the first retained record.
    base: i64,
    records: Vec<Record>,
    owner: Option<mpsc::UnboundedSender<ConsumedRecord>>,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            base: 0,
            records: Vec::new(),
            owner: None,
        }
    }

    fn offsets(&self) -> PartitionOffsets {
        PartitionOffsets {
            oldest: self.base,
            newest: self.base + self.records.len() as i64,
        }
    }
}

struct MemberState {
    metadata: Vec<u8>,
    callback: Arc<dyn AssignmentCallback>,
    events: mpsc::UnboundedSender<GroupEvent>,
}

struct TopicState {
    partitions: Vec<PartitionLog>,
    generation: u64,
    members: BTreeMap<MemberId, MemberState>,
}

struct Shared {
    /// Highest replication factor this "cluster" can satisfy.
    replication_limit: i16,
    topics: Mutex<HashMap<String, TopicState>>,
    /// Serializes rebalance passes across the broker.
    rebalance_gate: tokio::sync::Mutex<()>,
    member_seq: AtomicU64,
}

/// In-memory broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryBroker {
    /// `replication_limit` is the highest replication factor `create_topic`
    /// will accept, modeling cluster size.
    pub fn new(replication_limit: i16) -> Self {
        Self {
            shared: Arc::new(Shared {
                replication_limit,
                topics: Mutex::new(HashMap::new()),
                rebalance_gate: tokio::sync::Mutex::new(()),
                member_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Remove a member without any graceful handoff, as a session timeout
    /// would. Failure-injection hook for crash tests.
    pub fn kill_member(&self, topic: &str, member_id: &str) {
        Shared::remove_member(&self.shared, topic, member_id);
    }
}

impl Shared {
    fn remove_member(shared: &Arc<Shared>, topic: &str, member_id: &str) {
        let removed = {
            let mut topics = shared.topics.lock();
            match topics.get_mut(topic) {
                Some(t) => t.members.remove(member_id).is_some(),
                None => false,
            }
        };
        if removed {
            Self::schedule_rebalance(shared, topic.to_string());
        }
    }

    fn schedule_rebalance(shared: &Arc<Shared>, topic: String) {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            Self::rebalance(shared, topic).await;
        });
    }

    async fn rebalance(shared: Arc<Shared>, topic: String) {
        let _gate = shared.rebalance_gate.lock().await;

        let mut attempts = 0u32;
        loop {
            // Snapshot under the lock, revoke every owner, then run the
            // callback with the lock released so it may call back into the
            // broker (offsets, add_partitions) without deadlocking.
            let snapshot = {
                let mut topics = shared.topics.lock();
                let Some(t) = topics.get_mut(&topic) else {
                    return;
                };
                if t.members.is_empty() {
                    return;
                }
                t.generation += 1;
                for log in t.partitions.iter_mut() {
                    log.owner = None;
                }
                for member in t.members.values() {
                    let _ = member.events.send(GroupEvent::Revoked);
                }
                let offsets: HashMap<i32, PartitionOffsets> = t
                    .partitions
                    .iter()
                    .enumerate()
                    .map(|(i, log)| (i as i32, log.offsets()))
                    .collect();
                Snapshot {
                    generation: t.generation,
                    metas: t
                        .members
                        .iter()
                        .map(|(id, m)| (id.clone(), m.metadata.clone()))
                        .collect(),
                    // Group "leader" duties fall to the longest-lived member.
                    callback: t
                        .members
                        .values()
                        .next()
                        .map(|m| Arc::clone(&m.callback))
                        .expect("non-empty members"),
                    partitions: (0..t.partitions.len() as i32).collect(),
                    offsets,
                }
            };

            let result = snapshot
                .callback
                .assign(&snapshot.metas, &snapshot.partitions, &snapshot.offsets)
                .await;

            let assignments = match result {
                Ok(assignments) => assignments,
                Err(err) => {
                    attempts += 1;
                    if attempts >= MAX_ASSIGN_ATTEMPTS {
                        warn!(topic = %topic, error = %err, "assignment failed repeatedly, waiting for next membership change");
                        return;
                    }
                    debug!(topic = %topic, error = %err, attempt = attempts, "assignment failed, retrying");
                    tokio::time::sleep(ASSIGN_RETRY_DELAY).await;
                    continue;
                }
            };

            let mut topics = shared.topics.lock();
            let Some(t) = topics.get_mut(&topic) else {
                return;
            };
            if t.generation != snapshot.generation {
                // Membership changed while computing; start over.
                continue;
            }

            let TopicState {
                partitions,
                members,
                ..
            } = t;
            for (member_id, member) in members.iter() {
                let assignment = assignments.get(member_id).cloned().unwrap_or_default();
                let mut channels = HashMap::new();
                for &p in &assignment.partitions {
                    let Some(log) = partitions.get_mut(p as usize) else {
                        continue;
                    };
                    let (tx, rx) = mpsc::unbounded_channel();
                    for (i, record) in log.records.iter().enumerate() {
                        let _ = tx.send(ConsumedRecord {
                            partition: p,
                            offset: log.base + i as i64,
                            record: record.clone(),
                        });
                    }
                    log.owner = Some(tx);
                    channels.insert(p, rx);
                }
                let _ = member.events.send(GroupEvent::Assigned {
                    generation: snapshot.generation,
                    partitions: assignment.partitions.clone(),
                    data: assignment.data.clone(),
                    channels,
                });
            }
            return;
        }
    }
}

struct Snapshot {
    generation: u64,
    metas: BTreeMap<MemberId, Vec<u8>>,
    callback: Arc<dyn AssignmentCallback>,
    partitions: Vec<i32>,
    offsets: HashMap<i32, PartitionOffsets>,
}

struct MemoryGroupControl {
    shared: Arc<Shared>,
    topic: String,
    member_id: MemberId,
}

impl GroupControl for MemoryGroupControl {
    fn update_metadata(&self, metadata: Vec<u8>) {
        let mut topics = self.shared.topics.lock();
        if let Some(t) = topics.get_mut(&self.topic) {
            if let Some(member) = t.members.get_mut(&self.member_id) {
                member.metadata = metadata;
            }
        }
    }

    fn rejoin(&self) {
        Shared::schedule_rebalance(&self.shared, self.topic.clone());
    }

    fn leave(&self) {
        Shared::remove_member(&self.shared, &self.topic, &self.member_id);
    }
}

#[async_trait]
impl LogBroker for MemoryBroker {
    async fn create_topic(&self, topic: &str, partitions: i32, replication: i16) -> Result<()> {
        if replication > self.shared.replication_limit {
            return Err(RpcError::Broker(anyhow::anyhow!(
                "insufficient brokers for replication factor {}",
                replication
            )));
        }
        let mut topics = self.shared.topics.lock();
        topics.entry(topic.to_string()).or_insert_with(|| TopicState {
            partitions: (0..partitions.max(1)).map(|_| PartitionLog::new()).collect(),
            generation: 0,
            members: BTreeMap::new(),
        });
        Ok(())
    }

    async fn add_partitions(&self, topic: &str, total: i32) -> Result<()> {
        let mut topics = self.shared.topics.lock();
        let t = topics
            .get_mut(topic)
            .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown topic {:?}", topic)))?;
        while (t.partitions.len() as i32) < total {
            t.partitions.push(PartitionLog::new());
        }
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topics = self.shared.topics.lock();
        let t = topics
            .get(topic)
            .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown topic {:?}", topic)))?;
        Ok((0..t.partitions.len() as i32).collect())
    }

    async fn offsets(&self, topic: &str, partition: i32) -> Result<PartitionOffsets> {
        let topics = self.shared.topics.lock();
        let t = topics
            .get(topic)
            .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown topic {:?}", topic)))?;
        t.partitions
            .get(partition as usize)
            .map(|log| log.offsets())
            .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown partition {}", partition)))
    }

    async fn produce(&self, topic: &str, partition: i32, record: Record) -> Result<i64> {
        let mut topics = self.shared.topics.lock();
        let t = topics
            .get_mut(topic)
            .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown topic {:?}", topic)))?;
        let log = t
            .partitions
            .get_mut(partition as usize)
            .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown partition {}", partition)))?;
        let offset = log.base + log.records.len() as i64;
        log.records.push(record.clone());
        if let Some(owner) = &log.owner {
            if owner
                .send(ConsumedRecord {
                    partition,
                    offset,
                    record,
                })
                .is_err()
            {
                // Consumer went away; the record stays in the log for the
                // next owner (or the recovery leader).
                log.owner = None;
            }
        }
        Ok(offset)
    }

    async fn delete_records(&self, topic: &str, partition: i32, before: i64) -> Result<()> {
        let mut topics = self.shared.topics.lock();
        let t = topics
            .get_mut(topic)
            .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown topic {:?}", topic)))?;
        let log = t
            .partitions
            .get_mut(partition as usize)
            .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown partition {}", partition)))?;
        let newest = log.base + log.records.len() as i64;
        let cut = before.clamp(log.base, newest);
        log.records.drain(..(cut - log.base) as usize);
        log.base = cut;
        Ok(())
    }

    async fn join_group(
        &self,
        topic: &str,
        metadata: Vec<u8>,
        callback: Arc<dyn AssignmentCallback>,
    ) -> Result<GroupSession> {
        let member_id = format!("m{:08}", self.shared.member_seq.fetch_add(1, Ordering::SeqCst));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut topics = self.shared.topics.lock();
            let t = topics
                .get_mut(topic)
                .ok_or_else(|| RpcError::Broker(anyhow::anyhow!("unknown topic {:?}", topic)))?;
            t.members.insert(
                member_id.clone(),
                MemberState {
                    metadata,
                    callback,
                    events: events_tx,
                },
            );
        }
        Shared::schedule_rebalance(&self.shared, topic.to_string());
        Ok(GroupSession {
            member_id: member_id.clone(),
            events: events_rx,
            control: Arc::new(MemoryGroupControl {
                shared: Arc::clone(&self.shared),
                topic: topic.to_string(),
                member_id,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: &str) -> Record {
        Record {
            key: None,
            value: tag.as_bytes().to_vec(),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    struct EvenSplit;

    #[async_trait]
    impl AssignmentCallback for EvenSplit {
        async fn assign(
            &self,
            members: &BTreeMap<MemberId, Vec<u8>>,
            partitions: &[i32],
            _offsets: &HashMap<i32, PartitionOffsets>,
        ) -> Result<HashMap<MemberId, super::super::MemberAssignment>> {
            // One partition per member, join order.
            Ok(members
                .keys()
                .enumerate()
                .map(|(i, id)| {
                    (
                        id.clone(),
                        super::super::MemberAssignment {
                            partitions: partitions.get(i).copied().into_iter().collect(),
                            data: Vec::new(),
                        },
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_create_topic_replication_limit() {
        let broker = MemoryBroker::new(1);
        assert!(broker.create_topic("t", 4, 3).await.is_err());
        assert!(broker.create_topic("t", 4, 1).await.is_ok());
        // Idempotent once created.
        assert!(broker.create_topic("t", 4, 1).await.is_ok());
        assert_eq!(broker.partitions("t").await.unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_produce_offsets_and_truncate() {
        let broker = MemoryBroker::default();
        broker.create_topic("t", 2, 1).await.unwrap();
        assert_eq!(broker.produce("t", 1, record("a")).await.unwrap(), 0);
        assert_eq!(broker.produce("t", 1, record("b")).await.unwrap(), 1);

        let offsets = broker.offsets("t", 1).await.unwrap();
        assert_eq!((offsets.oldest, offsets.newest), (0, 2));

        broker.delete_records("t", 1, 1).await.unwrap();
        let offsets = broker.offsets("t", 1).await.unwrap();
        assert_eq!((offsets.oldest, offsets.newest), (1, 2));
        // Offsets keep advancing past the truncation point.
        assert_eq!(broker.produce("t", 1, record("c")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_join_delivers_backlog_and_live_records() {
        let broker = MemoryBroker::default();
        broker.create_topic("t", 1, 1).await.unwrap();
        broker.produce("t", 0, record("backlog")).await.unwrap();

        let mut session = broker
            .join_group("t", Vec::new(), Arc::new(EvenSplit))
            .await
            .unwrap();

        let assigned = loop {
            match session.events.recv().await.expect("event") {
                GroupEvent::Assigned {
                    partitions,
                    channels,
                    ..
                } => break (partitions, channels),
                GroupEvent::Revoked => continue,
            }
        };
        let (partitions, mut channels) = assigned;
        assert_eq!(partitions, vec![0]);
        let rx = channels.get_mut(&0).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.record.value, b"backlog");
        assert_eq!(first.offset, 0);

        broker.produce("t", 0, record("live")).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.record.value, b"live");
        assert_eq!(second.offset, 1);
    }

    #[tokio::test]
    async fn test_member_removal_triggers_rebalance() {
        let broker = MemoryBroker::default();
        broker.create_topic("t", 2, 1).await.unwrap();

        let mut a = broker
            .join_group("t", Vec::new(), Arc::new(EvenSplit))
            .await
            .unwrap();
        let b = broker
            .join_group("t", Vec::new(), Arc::new(EvenSplit))
            .await
            .unwrap();

        broker.kill_member("t", &b.member_id);

        // Survivor eventually sees a fresh assignment after the kill.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let mut last_generation = 0;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), a.events.recv()).await {
                Ok(Some(GroupEvent::Assigned { generation, .. })) => {
                    last_generation = generation;
                    if generation >= 3 {
                        break;
                    }
                }
                Ok(Some(GroupEvent::Revoked)) => continue,
                _ => break,
            }
        }
        assert!(last_generation >= 2, "expected post-kill generation");
    }
}
