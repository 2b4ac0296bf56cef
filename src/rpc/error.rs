//! RPC engine error types
//!
//! This module defines a custom error type for engine operations, providing
//! better type safety and more informative error messages than using
//! `Box<dyn std::error::Error>`.
//!
//! Callers of `Call` only ever observe three shapes: an application error
//! carried in a `Response`, a cancellation/deadline error, or `Unavailable`
//! when no live route exists. Everything else is internal.

use thiserror::Error;

/// Errors that can occur during RPC engine operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// No live route for a Node/Service/Session target. Retryable by the
    /// caller once the routing table changes.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The caller's cancellation context fired.
    #[error("operation canceled")]
    Canceled,

    /// The request's wall-clock deadline elapsed.
    #[error("deadline expired")]
    DeadlineExpired,

    /// Application error returned by a remote handler, delivered as a result
    /// and never crashing the engine.
    #[error("{0}")]
    Application(String),

    /// The group has more members than assignable partitions. Internal and
    /// transient; triggers administrative repartition and a retried rebalance.
    #[error("too few partitions: need {needed}, have {available}")]
    TooFewPartitions { needed: usize, available: usize },

    /// A record could not be decoded back into a message.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Error surfaced by the broker or placement store backend.
    #[error("broker error: {0}")]
    Broker(#[from] anyhow::Error),

    /// The engine has been shut down.
    #[error("engine closed")]
    Closed,
}

impl RpcError {
    /// Whether the caller may retry after the routing table changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Unavailable(_) | RpcError::TooFewPartitions { .. }
        )
    }

    /// Whether a failed produce with this error is survivable. Anything else
    /// means a caller may be blocked on a reply that can never be produced.
    pub fn is_survivable_send_failure(&self) -> bool {
        matches!(
            self,
            RpcError::Unavailable(_) | RpcError::Canceled | RpcError::DeadlineExpired
        )
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, RpcError>;
