//! Engine configuration
//!
//! Everything tunable about an engine instance lives here, with defaults
//! suitable for a small cluster. The failure policy is injectable so tests
//! can observe unrecoverable conditions instead of exiting.

use std::sync::Arc;

use tracing::error;

use crate::rpc::constants::{
    DEFAULT_LANE_IDLE_MS, DEFAULT_REPLICATION_FACTOR, DEFAULT_SESSION_CACHE_SIZE,
    DEFAULT_TOPIC_PARTITIONS,
};

/// What to do when the engine hits a condition it cannot recover from, such
/// as a failed produce of a completion some caller is blocked on.
pub trait FailurePolicy: Send + Sync {
    fn on_fatal(&self, reason: &str);
}

/// Production policy: log and terminate the process. A supervisor restart is
/// the only safe way forward once a completion cannot be produced.
pub struct ExitPolicy;

impl FailurePolicy for ExitPolicy {
    fn on_fatal(&self, reason: &str) {
        error!(%reason, "unrecoverable engine failure");
        std::process::exit(1);
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct Config {
    /// Application topic carrying all RPC traffic for this fabric.
    pub topic: String,
    /// Process identity; generated fresh when unset. Must never be reused
    /// across restarts.
    pub node_id: Option<String>,
    /// Partitions created with the topic. Partition 0 is reserved, so this
    /// bounds initial cluster size at `partitions - 1` nodes; the engine
    /// grows the topic on demand beyond that.
    pub partitions: i32,
    /// Preferred replication factor; the engine falls back to 1 when the
    /// cluster cannot satisfy it.
    pub replication: i16,
    /// Capacity of the local session placement cache.
    pub session_cache_size: usize,
    /// Idle time after which a per-session dispatch lane is retired.
    pub lane_idle_ms: u64,
    pub failure_policy: Arc<dyn FailurePolicy>,
}

impl Config {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            node_id: None,
            partitions: DEFAULT_TOPIC_PARTITIONS,
            replication: DEFAULT_REPLICATION_FACTOR,
            session_cache_size: DEFAULT_SESSION_CACHE_SIZE,
            lane_idle_ms: DEFAULT_LANE_IDLE_MS,
            failure_policy: Arc::new(ExitPolicy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("app");
        assert_eq!(config.topic, "app");
        assert_eq!(config.partitions, DEFAULT_TOPIC_PARTITIONS);
        assert_eq!(config.replication, DEFAULT_REPLICATION_FACTOR);
        assert!(config.node_id.is_none());
    }
}
