//! Reliable RPC over a partitioned log
//!
//! Layered bottom-up: the message model and codec, the broker abstraction
//! with an in-memory implementation, session placement, routing, the
//! generation assignment strategy, crash recovery, and the engine that ties
//! them together.

pub mod assignment;
pub mod broker;
pub mod codec;
pub mod constants;
pub mod engine;
pub mod error;
pub mod message;
pub mod pending;
pub mod placement;
pub mod recovery;
pub mod routing;
