//! Shared constants for the RPC engine
//!
//! Centralizes defaults and key prefixes so configuration, routing, and the
//! placement client agree on one set of values.

/// Default number of partitions created for a fresh application topic.
/// Partition 0 is reserved, so this supports three nodes out of the box.
pub const DEFAULT_TOPIC_PARTITIONS: i32 = 4;

/// Preferred replication factor for the application topic.
pub const DEFAULT_REPLICATION_FACTOR: i16 = 3;

/// Replication factor used when the preferred factor cannot be satisfied
/// (e.g. a single-broker development cluster).
pub const FALLBACK_REPLICATION_FACTOR: i16 = 1;

/// Maximum number of session placements kept in the local cache.
pub const DEFAULT_SESSION_CACHE_SIZE: usize = 4096;

/// Interval at which blocked waiters re-check the placement store for a
/// parked result hint.
pub const PARKED_POLL_INTERVAL_MS: u64 = 200;

/// How long an idle per-session dispatch lane lives before it is retired.
pub const DEFAULT_LANE_IDLE_MS: u64 = 60_000;

/// Maximum entries kept in each in-memory dedup set. Suppression of very old
/// duplicates degrades to the recovery head boundary past this point.
pub const DEDUP_CAPACITY: usize = 65_536;

/// Key prefix for session placement entries in the placement store.
pub const PLACEMENT_KEY_PREFIX: &str = "rpc_";

/// Key prefix for parked response-redirect hints.
pub const ALT_KEY_PREFIX: &str = "alt_";

/// Key prefix for the recorded partition-0 recovery boundary.
pub const HEAD_KEY_PREFIX: &str = "rpc_head_";

/// Error message produced when a node-pinned call can never be delivered.
pub const ERR_NODE_DIED: &str = "node died before processing call request";

/// Error message for requests whose deadline elapsed before dispatch.
pub const ERR_DEADLINE_EXPIRED: &str = "deadline expired";

/// Error message for a request naming a method nobody registered.
pub const ERR_UNDEFINED_METHOD: &str = "undefined method";
