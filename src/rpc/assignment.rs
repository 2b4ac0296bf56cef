//! Partition assignment strategy
//!
//! Invoked through the broker's consumer-group protocol whenever membership
//! changes. Each member advertises its node identity, hosted services, and
//! last-known partition; the strategy rebuilds the routing snapshot, keeps
//! home partitions sticky, detects whether a recovery pass is required, and
//! hands free partitions to newcomers.
//!
//! Partition 0 is reserved: it is never a home partition. A generation is
//! **dirty** when a partition owned by no live member still holds records
//! (a node died with unacknowledged work), or when partition 0 holds records
//! past the recorded head boundary. A dirty plan gives partition 0 plus all
//! non-empty orphan partitions to the recovery leader and nothing to anyone
//! else for that generation.
//!
//! # Metadata wire format
//!
//! ```text
//! version:     i16
//! node_id:     u16 length + bytes
//! partition:   i32 (0 = unassigned)
//! claims_zero: u8
//! services:    i32 count, each u16 length + bytes
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use super::broker::{
    AssignmentCallback, LogBroker, MemberAssignment, MemberId, PartitionOffsets,
};
use super::error::{Result, RpcError};
use super::message::NodeId;
use super::placement::{head_key, PlacementStore};
use super::routing::RoutingSnapshot;

const META_VERSION: i16 = 0;
const PLAN_VERSION: i16 = 0;

/// A member's advertised metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberMeta {
    pub node_id: NodeId,
    /// Services hosted by this node.
    pub services: Vec<String>,
    /// Last-known home partition (0 = unassigned).
    pub partition: i32,
    /// Whether this node claimed partition 0 last generation.
    pub claims_zero: bool,
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(RpcError::CorruptRecord("truncated string length".into()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(RpcError::CorruptRecord("truncated string body".into()));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|e| RpcError::CorruptRecord(format!("invalid utf-8: {}", e)))
}

/// Encode member metadata for the group join.
pub fn encode_meta(meta: &MemberMeta) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_i16(META_VERSION);
    put_string(&mut buf, &meta.node_id);
    buf.put_i32(meta.partition);
    buf.put_u8(meta.claims_zero as u8);
    buf.put_i32(meta.services.len() as i32);
    for service in &meta.services {
        put_string(&mut buf, service);
    }
    buf.to_vec()
}

/// Parse member metadata from raw join bytes.
pub fn parse_meta(bytes: &[u8]) -> Result<MemberMeta> {
    let mut buf = bytes;
    if buf.remaining() < 2 {
        return Err(RpcError::CorruptRecord("metadata too short".into()));
    }
    let _version = buf.get_i16();
    let node_id = get_string(&mut buf)?;
    if buf.remaining() < 5 {
        return Err(RpcError::CorruptRecord("truncated metadata".into()));
    }
    let partition = buf.get_i32();
    let claims_zero = buf.get_u8() != 0;
    if buf.remaining() < 4 {
        return Err(RpcError::CorruptRecord("truncated service count".into()));
    }
    let count = buf.get_i32();
    if count < 0 {
        return Err(RpcError::CorruptRecord(format!(
            "invalid service count {}",
            count
        )));
    }
    let mut services = Vec::with_capacity(count as usize);
    for _ in 0..count {
        services.push(get_string(&mut buf)?);
    }
    Ok(MemberMeta {
        node_id,
        services,
        partition,
        claims_zero,
    })
}

/// Input for one generation's assignment computation.
#[derive(Debug, Clone)]
pub struct AssignmentInput {
    pub members: BTreeMap<MemberId, MemberMeta>,
    pub partitions: Vec<i32>,
    pub offsets: HashMap<i32, PartitionOffsets>,
    /// Recorded partition-0 offset boundary already processed by a previous
    /// recovery pass.
    pub head: i64,
}

/// Output of one generation's assignment computation.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentPlan {
    pub routes: RoutingSnapshot,
    pub dirty: bool,
    /// Node elected to own partition 0 (the recovery leader when dirty).
    pub leader: NodeId,
    pub assignments: HashMap<MemberId, Vec<i32>>,
}

/// Compute the assignment plan for the current membership.
///
/// Fails with `TooFewPartitions` when members outnumber assignable
/// partitions, in which case the caller grows the topic administratively and
/// the rebalance is retried on the next generation.
pub fn plan_generation(input: &AssignmentInput) -> Result<AssignmentPlan> {
    let members = &input.members;
    let partition_set: HashSet<i32> = input.partitions.iter().copied().collect();

    // Service map over all current members.
    let mut services: HashMap<String, Vec<NodeId>> = HashMap::new();
    for meta in members.values() {
        for service in &meta.services {
            services
                .entry(service.clone())
                .or_default()
                .push(meta.node_id.clone());
        }
    }
    for nodes in services.values_mut() {
        nodes.sort();
        nodes.dedup();
    }

    // Sticky home partitions: a live node keeps its previous partition.
    let mut claimed: HashSet<i32> = HashSet::new();
    claimed.insert(0);
    let mut homes: BTreeMap<MemberId, i32> = BTreeMap::new();
    for (id, meta) in members {
        if meta.partition > 0
            && partition_set.contains(&meta.partition)
            && claimed.insert(meta.partition)
        {
            homes.insert(id.clone(), meta.partition);
        }
    }

    // Hand free partitions to newcomers, in deterministic order.
    let mut free: Vec<i32> = input
        .partitions
        .iter()
        .copied()
        .filter(|p| !claimed.contains(p))
        .collect();
    free.sort_unstable();
    let mut free = free.into_iter();
    let mut short = 0usize;
    for id in members.keys() {
        if homes.contains_key(id) {
            continue;
        }
        match free.next() {
            Some(p) => {
                claimed.insert(p);
                homes.insert(id.clone(), p);
            }
            None => short += 1,
        }
    }
    if short > 0 {
        return Err(RpcError::TooFewPartitions {
            needed: input.partitions.len() + short,
            available: input.partitions.len(),
        });
    }

    let nodes: HashMap<NodeId, i32> = members
        .iter()
        .map(|(id, meta)| (meta.node_id.clone(), homes[id]))
        .collect();

    // Dirty detection: an orphan partition still holding records means a
    // node died with unacknowledged messages; records on partition 0 past
    // the recorded head are likewise unprocessed.
    let owned: HashSet<i32> = homes.values().copied().collect();
    let dirty_orphans: Vec<i32> = input
        .partitions
        .iter()
        .copied()
        .filter(|p| *p != 0 && !owned.contains(p))
        .filter(|p| input.offsets.get(p).is_some_and(|o| !o.is_empty()))
        .collect();
    let zero_pending = input
        .offsets
        .get(&0)
        .is_some_and(|o| o.newest > input.head.max(o.oldest));
    let dirty = !dirty_orphans.is_empty() || zero_pending;

    // Partition 0 claimant: sticky when the previous claimant is still
    // live, otherwise the lowest node id.
    let leader = members
        .values()
        .filter(|m| m.claims_zero)
        .map(|m| m.node_id.clone())
        .min()
        .or_else(|| members.values().map(|m| m.node_id.clone()).min())
        .unwrap_or_default();

    let mut assignments: HashMap<MemberId, Vec<i32>> = HashMap::new();
    for (id, meta) in members {
        let mut ps: Vec<i32> = Vec::new();
        if dirty {
            if meta.node_id == leader {
                ps.push(0);
                ps.extend_from_slice(&dirty_orphans);
                ps.push(homes[id]);
            }
        } else {
            ps.push(homes[id]);
            if meta.node_id == leader {
                ps.push(0);
            }
        }
        ps.sort_unstable();
        ps.dedup();
        assignments.insert(id.clone(), ps);
    }

    Ok(AssignmentPlan {
        routes: RoutingSnapshot { services, nodes },
        dirty,
        leader,
        assignments,
    })
}

/// Encode a plan for broadcast in the per-member assignment data.
pub fn encode_plan(plan: &AssignmentPlan) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_i16(PLAN_VERSION);
    buf.put_u8(plan.dirty as u8);
    put_string(&mut buf, &plan.leader);

    let mut nodes: Vec<(&NodeId, &i32)> = plan.routes.nodes.iter().collect();
    nodes.sort();
    buf.put_i32(nodes.len() as i32);
    for (node, partition) in nodes {
        put_string(&mut buf, node);
        buf.put_i32(*partition);
    }

    let mut services: Vec<(&String, &Vec<NodeId>)> = plan.routes.services.iter().collect();
    services.sort();
    buf.put_i32(services.len() as i32);
    for (name, hosts) in services {
        put_string(&mut buf, name);
        buf.put_i32(hosts.len() as i32);
        for host in hosts {
            put_string(&mut buf, host);
        }
    }
    buf.to_vec()
}

/// Decode a broadcast plan. The per-member partition list travels separately
/// in the assignment itself.
pub fn parse_plan(bytes: &[u8]) -> Result<(RoutingSnapshot, bool, NodeId)> {
    let mut buf = bytes;
    if buf.remaining() < 3 {
        return Err(RpcError::CorruptRecord("plan too short".into()));
    }
    let _version = buf.get_i16();
    let dirty = buf.get_u8() != 0;
    let leader = get_string(&mut buf)?;

    if buf.remaining() < 4 {
        return Err(RpcError::CorruptRecord("truncated node table".into()));
    }
    let node_count = buf.get_i32();
    let mut nodes = HashMap::new();
    for _ in 0..node_count.max(0) {
        let node = get_string(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(RpcError::CorruptRecord("truncated node partition".into()));
        }
        nodes.insert(node, buf.get_i32());
    }

    if buf.remaining() < 4 {
        return Err(RpcError::CorruptRecord("truncated service table".into()));
    }
    let service_count = buf.get_i32();
    let mut services = HashMap::new();
    for _ in 0..service_count.max(0) {
        let name = get_string(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(RpcError::CorruptRecord("truncated service hosts".into()));
        }
        let host_count = buf.get_i32();
        let mut hosts = Vec::with_capacity(host_count.max(0) as usize);
        for _ in 0..host_count.max(0) {
            hosts.push(get_string(&mut buf)?);
        }
        services.insert(name, hosts);
    }

    Ok((RoutingSnapshot { services, nodes }, dirty, leader))
}

/// Read the recorded partition-0 head boundary, defaulting to 0.
pub(crate) async fn read_head(store: &dyn PlacementStore, topic: &str) -> Result<i64> {
    Ok(store
        .get(&head_key(topic))
        .await?
        .and_then(|raw| String::from_utf8_lossy(&raw).parse().ok())
        .unwrap_or(0))
}

/// The engine's broker-facing assignment callback: parses member metadata,
/// runs [`plan_generation`], and grows the topic when partitions run short.
pub(crate) struct EngineAssigner {
    pub broker: Arc<dyn LogBroker>,
    pub store: Arc<dyn PlacementStore>,
    pub topic: String,
}

#[async_trait]
impl AssignmentCallback for EngineAssigner {
    async fn assign(
        &self,
        members: &BTreeMap<MemberId, Vec<u8>>,
        partitions: &[i32],
        offsets: &HashMap<i32, PartitionOffsets>,
    ) -> Result<HashMap<MemberId, MemberAssignment>> {
        let mut metas = BTreeMap::new();
        for (id, raw) in members {
            match parse_meta(raw) {
                Ok(meta) => {
                    metas.insert(id.clone(), meta);
                }
                Err(err) => {
                    warn!(member = %id, error = %err, "ignoring member with bad metadata");
                }
            }
        }

        let input = AssignmentInput {
            members: metas,
            partitions: partitions.to_vec(),
            offsets: offsets.clone(),
            head: read_head(self.store.as_ref(), &self.topic).await?,
        };

        match plan_generation(&input) {
            Ok(plan) => {
                debug!(
                    dirty = plan.dirty,
                    leader = %plan.leader,
                    members = input.members.len(),
                    "computed assignment plan"
                );
                let data = encode_plan(&plan);
                Ok(plan
                    .assignments
                    .into_iter()
                    .map(|(id, partitions)| {
                        (
                            id,
                            MemberAssignment {
                                partitions,
                                data: data.clone(),
                            },
                        )
                    })
                    .collect())
            }
            Err(RpcError::TooFewPartitions { needed, available }) => {
                debug!(needed, available, "growing topic and retrying rebalance");
                self.broker
                    .add_partitions(&self.topic, needed as i32)
                    .await?;
                Err(RpcError::TooFewPartitions { needed, available })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(node: &str, services: &[&str], partition: i32, claims_zero: bool) -> MemberMeta {
        MemberMeta {
            node_id: node.to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
            partition,
            claims_zero,
        }
    }

    fn input(
        members: Vec<(&str, MemberMeta)>,
        partitions: Vec<i32>,
        filled: Vec<(i32, i64)>,
        head: i64,
    ) -> AssignmentInput {
        let offsets = partitions
            .iter()
            .map(|&p| {
                let newest = filled
                    .iter()
                    .find(|(fp, _)| *fp == p)
                    .map(|(_, n)| *n)
                    .unwrap_or(0);
                (
                    p,
                    PartitionOffsets {
                        oldest: 0,
                        newest,
                    },
                )
            })
            .collect();
        AssignmentInput {
            members: members
                .into_iter()
                .map(|(id, m)| (id.to_string(), m))
                .collect(),
            partitions,
            offsets,
            head,
        }
    }

    #[test]
    fn test_meta_round_trip() {
        let m = meta("node-a", &["incr", "mailer"], 3, true);
        assert_eq!(parse_meta(&encode_meta(&m)).unwrap(), m);
    }

    #[test]
    fn test_meta_round_trip_empty_services() {
        let m = meta("node-a", &[], 0, false);
        assert_eq!(parse_meta(&encode_meta(&m)).unwrap(), m);
    }

    #[test]
    fn test_sticky_home_partitions() {
        let input = input(
            vec![
                ("m1", meta("a", &["svc"], 2, false)),
                ("m2", meta("b", &["svc"], 1, false)),
            ],
            vec![0, 1, 2],
            vec![],
            0,
        );
        let plan = plan_generation(&input).unwrap();
        assert!(!plan.dirty);
        assert_eq!(plan.routes.nodes["a"], 2);
        assert_eq!(plan.routes.nodes["b"], 1);
    }

    #[test]
    fn test_newcomer_gets_free_partition() {
        let input = input(
            vec![
                ("m1", meta("a", &["svc"], 1, false)),
                ("m2", meta("b", &["svc"], 0, false)),
            ],
            vec![0, 1, 2],
            vec![],
            0,
        );
        let plan = plan_generation(&input).unwrap();
        assert_eq!(plan.routes.nodes["b"], 2);
    }

    #[test]
    fn test_too_few_partitions() {
        let input = input(
            vec![
                ("m1", meta("a", &["svc"], 1, false)),
                ("m2", meta("b", &["svc"], 0, false)),
            ],
            vec![0, 1],
            vec![],
            0,
        );
        let err = plan_generation(&input).unwrap_err();
        match err {
            RpcError::TooFewPartitions { needed, available } => {
                assert_eq!(available, 2);
                assert_eq!(needed, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_dirty_on_nonempty_orphan() {
        // Partition 2's previous owner is gone and records remain.
        let input = input(
            vec![("m1", meta("a", &["svc"], 1, false))],
            vec![0, 1, 2],
            vec![(2, 5)],
            0,
        );
        let plan = plan_generation(&input).unwrap();
        assert!(plan.dirty);
        // Leader takes partition 0, the dirty orphan, and its own home.
        assert_eq!(plan.assignments["m1"], vec![0, 1, 2]);
    }

    #[test]
    fn test_clean_when_orphans_empty() {
        let input = input(
            vec![("m1", meta("a", &["svc"], 1, false))],
            vec![0, 1, 2],
            vec![],
            0,
        );
        let plan = plan_generation(&input).unwrap();
        assert!(!plan.dirty);
        assert_eq!(plan.assignments["m1"], vec![0, 1]);
    }

    #[test]
    fn test_dirty_on_partition_zero_past_head() {
        let input = input(
            vec![("m1", meta("a", &["svc"], 1, false))],
            vec![0, 1],
            vec![(0, 7)],
            5,
        );
        let plan = plan_generation(&input).unwrap();
        assert!(plan.dirty);

        // Once the head catches up the same records are benign.
        let input2 = input2_with_head();
        let plan2 = plan_generation(&input2).unwrap();
        assert!(!plan2.dirty);
    }

    fn input2_with_head() -> AssignmentInput {
        input(
            vec![("m1", meta("a", &["svc"], 1, false))],
            vec![0, 1],
            vec![(0, 7)],
            7,
        )
    }

    #[test]
    fn test_dirty_assignment_excludes_other_members() {
        let input = input(
            vec![
                ("m1", meta("a", &["svc"], 1, true)),
                ("m2", meta("b", &["svc"], 2, false)),
            ],
            vec![0, 1, 2, 3],
            vec![(3, 4)],
            0,
        );
        let plan = plan_generation(&input).unwrap();
        assert!(plan.dirty);
        assert_eq!(plan.leader, "a");
        assert_eq!(plan.assignments["m1"], vec![0, 1, 3]);
        assert!(plan.assignments["m2"].is_empty());
    }

    #[test]
    fn test_leader_sticky_claimant() {
        let input = input(
            vec![
                ("m1", meta("a", &["svc"], 1, false)),
                ("m2", meta("b", &["svc"], 2, true)),
            ],
            vec![0, 1, 2],
            vec![],
            0,
        );
        let plan = plan_generation(&input).unwrap();
        assert_eq!(plan.leader, "b");
        assert!(plan.assignments["m2"].contains(&0));
        assert!(!plan.assignments["m1"].contains(&0));
    }

    #[test]
    fn test_plan_codec_round_trip() {
        let input = input(
            vec![
                ("m1", meta("a", &["svc", "other"], 1, false)),
                ("m2", meta("b", &["svc"], 2, false)),
            ],
            vec![0, 1, 2],
            vec![],
            0,
        );
        let plan = plan_generation(&input).unwrap();
        let (routes, dirty, leader) = parse_plan(&encode_plan(&plan)).unwrap();
        assert_eq!(routes.nodes, plan.routes.nodes);
        assert_eq!(dirty, plan.dirty);
        assert_eq!(leader, plan.leader);
        let mut hosts = routes.services["svc"].clone();
        hosts.sort();
        assert_eq!(hosts, vec!["a".to_string(), "b".to_string()]);
    }
}
