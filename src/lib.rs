//! # logrpc
//!
//! A reliable call/tell messaging fabric built on a partitioned log. Each
//! node owns one partition of a shared application topic; requests are
//! routed to services, sticky sessions, or specific nodes, and a
//! leader-driven recovery pass replays the in-flight chains of crashed
//! nodes so callers either get their answer or a definite error.
//!
//! ```no_run
//! use std::sync::Arc;
//! use logrpc::{Config, Engine, MemoryBroker, MemoryPlacementStore, Methods, Outcome, Target};
//!
//! # async fn example() -> logrpc::Result<()> {
//! let broker = Arc::new(MemoryBroker::new(3));
//! let store = Arc::new(MemoryPlacementStore::new());
//! let engine = Engine::connect(Config::new("app"), broker, store).await?;
//!
//! engine.register_service(
//!     "echo",
//!     Methods::new().on("say", |inbound| async move { Ok(Outcome::Reply(inbound.value)) }),
//! );
//!
//! let target = Target::Service { name: "echo".into() };
//! let reply = engine.call(target, "say", b"hi".to_vec(), None).await?;
//! assert_eq!(reply, b"hi");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod rpc;

pub use config::{Config, ExitPolicy, FailurePolicy};
pub use rpc::broker::{LogBroker, MemoryBroker};
pub use rpc::engine::{Engine, Inbound, Methods, Outcome, Redirect};
pub use rpc::error::{Result, RpcError};
pub use rpc::message::{Deadline, Message, NodeId, RequestId, Target, TargetKind};
pub use rpc::placement::{MemoryPlacementStore, PlacementStore};
