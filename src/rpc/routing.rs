//! Routing tables
//!
//! In-memory maps from service name to candidate nodes and from node to its
//! owned partition, rebuilt wholesale on every clean rebalance and pruned of
//! dead nodes going into a dirty one. A `tick` signal is bumped every time
//! the table changes so blocked senders wake and retry: a service or session
//! may simply not have been advertised by a live node *yet*.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::{Result, RpcError};
use super::message::NodeId;
use super::placement::{placement_key, PlacementCache, PlacementStore};

/// One generation's view of the group: who hosts what, and which partition
/// each node owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingSnapshot {
    /// service name -> nodes currently hosting it
    pub services: HashMap<String, Vec<NodeId>>,
    /// node -> its home partition
    pub nodes: HashMap<NodeId, i32>,
}

/// Shared routing state with a change signal.
pub struct RoutingTable {
    inner: RwLock<RoutingSnapshot>,
    tick: watch::Sender<u64>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        let (tick, _) = watch::channel(0);
        Self {
            inner: RwLock::new(RoutingSnapshot::default()),
            tick,
        }
    }

    /// Replace the whole table (clean rebalance).
    pub fn replace(&self, snapshot: RoutingSnapshot) {
        *self.inner.write() = snapshot;
        self.bump();
    }

    /// Drop every node not in `live` (defensive pruning going into a dirty
    /// rebalance), keeping the rest of the table intact.
    pub fn prune(&self, live: &HashSet<NodeId>) {
        {
            let mut table = self.inner.write();
            table.nodes.retain(|node, _| live.contains(node));
            for nodes in table.services.values_mut() {
                nodes.retain(|node| live.contains(node));
            }
            table.services.retain(|_, nodes| !nodes.is_empty());
        }
        self.bump();
    }

    fn bump(&self) {
        self.tick.send_modify(|v| *v += 1);
    }

    /// Subscribe to table changes. Waiters see every change after the call.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tick.subscribe()
    }

    /// Partition of a live node, if any. Non-blocking.
    pub fn lookup_node(&self, node: &str) -> Option<i32> {
        self.inner.read().nodes.get(node).copied()
    }

    /// Uniformly random live host of a service, with its partition.
    pub fn pick_service(&self, service: &str) -> Option<(NodeId, i32)> {
        let table = self.inner.read();
        let candidates: Vec<&NodeId> = table
            .services
            .get(service)?
            .iter()
            .filter(|node| table.nodes.contains_key(*node))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        let partition = table.nodes[pick];
        Some((pick.clone(), partition))
    }

    /// Full service map (introspection).
    pub fn topology(&self) -> HashMap<String, Vec<NodeId>> {
        self.inner.read().services.clone()
    }

    /// All live node ids (introspection).
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner.read().nodes.keys().cloned().collect()
    }

    /// Route to any live replica of a service, blocking on the tick signal
    /// until one is advertised or the context fires.
    pub async fn route_to_service(
        &self,
        ctx: &CancellationToken,
        service: &str,
    ) -> Result<(NodeId, i32)> {
        let mut tick = self.subscribe();
        loop {
            if let Some(found) = self.pick_service(service) {
                return Ok(found);
            }
            wait_tick(&mut tick, ctx).await?;
        }
    }

    /// Route to a specific node. Blocks only while no generation is known
    /// yet; once the table is populated, a missing node is not live and is
    /// reported as unavailable rather than waited for.
    pub async fn route_to_node(&self, ctx: &CancellationToken, node: &str) -> Result<i32> {
        let mut tick = self.subscribe();
        loop {
            {
                let table = self.inner.read();
                if let Some(partition) = table.nodes.get(node) {
                    return Ok(*partition);
                }
                if !table.nodes.is_empty() {
                    return Err(RpcError::Unavailable(format!("node {} is not live", node)));
                }
            }
            wait_tick(&mut tick, ctx).await?;
        }
    }

    /// Route to the node owning a session, placing it if unplaced.
    ///
    /// Consults the local cache first; otherwise races a CAS against the
    /// placement store with a randomly chosen live candidate as the proposed
    /// owner. Exactly one racer wins; everyone converges on the winner.
    pub async fn route_to_session(
        &self,
        ctx: &CancellationToken,
        store: &dyn PlacementStore,
        cache: &Mutex<PlacementCache>,
        service: &str,
        session: &str,
    ) -> Result<(NodeId, i32)> {
        let key = placement_key(service, session);

        {
            let mut cache = cache.lock();
            if let Some(node) = cache.get(&key) {
                if let Some(partition) = self.lookup_node(node) {
                    return Ok((node.clone(), partition));
                }
                // Owner vanished from the table; the cache entry is stale.
                cache.invalidate(&key);
            }
        }

        let mut tick = self.subscribe();
        loop {
            let placed = store
                .get(&key)
                .await?
                .map(|v| String::from_utf8_lossy(&v).into_owned());

            if let Some(node) = &placed {
                if let Some(partition) = self.lookup_node(node) {
                    cache.lock().insert(key, node.clone());
                    return Ok((node.clone(), partition));
                }
            }

            // Unplaced, or placed on a node we consider dead: propose a new
            // owner. CAS decides the race.
            let Some((candidate, _)) = self.pick_service(service) else {
                wait_tick(&mut tick, ctx).await?;
                continue;
            };
            let expected = placed.as_ref().map(|s| s.as_bytes());
            let actual = store.cas(&key, expected, candidate.as_bytes()).await?;
            let actual = String::from_utf8_lossy(&actual).into_owned();
            if let Some(partition) = self.lookup_node(&actual) {
                cache.lock().insert(key, actual.clone());
                return Ok((actual, partition));
            }
            // The winner is not live from our point of view; wait for the
            // table to change before contesting again.
            wait_tick(&mut tick, ctx).await?;
        }
    }
}

/// Block until the routing table changes or the context fires.
async fn wait_tick(tick: &mut watch::Receiver<u64>, ctx: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = ctx.cancelled() => Err(RpcError::Canceled),
        changed = tick.changed() => changed.map_err(|_| RpcError::Closed),
    }
}
