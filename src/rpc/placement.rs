//! Session placement store client
//!
//! Sticky session placement lives in an external key-value store with a
//! compare-and-swap primitive; CAS semantics guarantee exactly one node wins
//! a placement race. The store is authoritative; a bounded local cache keeps
//! the hot path off the network and is invalidated lazily, on the next miss
//! after the owning node left the routing table.
//!
//! Key namespaces: `rpc_<service>_<session>` for placement,
//! `alt_<requestID>` for transient response-redirect hints, and
//! `rpc_head_<topic>` for the recorded partition-0 recovery boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::constants::{ALT_KEY_PREFIX, HEAD_KEY_PREFIX, PLACEMENT_KEY_PREFIX};
use super::error::Result;

/// Placement key for a session of a service.
pub fn placement_key(service: &str, session: &str) -> String {
    format!("{}{}_{}", PLACEMENT_KEY_PREFIX, service, session)
}

/// Key parking a response whose target node's partition is unknown.
pub fn alt_key(request_id: &str) -> String {
    format!("{}{}", ALT_KEY_PREFIX, request_id)
}

/// Key recording the partition-0 offset boundary already processed.
pub fn head_key(topic: &str) -> String {
    format!("{}{}", HEAD_KEY_PREFIX, topic)
}

/// Key-value store with compare-and-swap, the engine's only requirement on
/// the external placement backend.
#[async_trait]
pub trait PlacementStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Atomically replace `expected` with `desired`, returning the value
    /// actually stored afterwards. `expected = None` means "absent". The
    /// caller won the race iff the returned value equals `desired`.
    async fn cas(&self, key: &str, expected: Option<&[u8]>, desired: &[u8]) -> Result<Vec<u8>>;
}

/// In-memory placement store with atomic CAS. Multiple engines sharing one
/// instance model sidecars sharing an external store.
#[derive(Default)]
pub struct MemoryPlacementStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryPlacementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlacementStore for MemoryPlacementStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, desired: &[u8]) -> Result<Vec<u8>> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|v| v.as_slice());
        if current == expected {
            entries.insert(key.to_string(), desired.to_vec());
            Ok(desired.to_vec())
        } else {
            Ok(current.unwrap_or_default().to_vec())
        }
    }
}

/// Bounded, non-authoritative cache of session placements.
///
/// Eviction is FIFO by insertion; staleness is handled by the caller, which
/// drops entries whose node is no longer live before trusting them.
pub struct PlacementCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: std::collections::VecDeque<String>,
}

impl PlacementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: std::collections::VecDeque::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, node: String) {
        if self.entries.insert(key.clone(), node).is_none() {
            self.order.push_back(key);
            while self.entries.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
