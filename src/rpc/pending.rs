//! Pending call registry
//!
//! Callers waiting on a `Response` or `Done` park a oneshot sender here keyed
//! by request id. The dispatcher resolves them when the completion arrives on
//! the caller's home partition. Duplicate completions are normal under
//! at-least-once delivery and resolve to a no-op.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::message::{NodeId, RequestId};

/// Terminal outcome of a call chain as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReply {
    pub value: Vec<u8>,
    /// Application-level error raised by the handler, if any.
    pub err_msg: Option<String>,
    /// Node that produced the reply (empty for `Done`).
    pub node: NodeId,
}

#[derive(Default)]
pub struct PendingCalls {
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<CallReply>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for a request id. A second registration for the
    /// same id replaces the first, whose receiver then reports closure.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<CallReply> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id.to_string(), tx);
        rx
    }

    /// Deliver a completion. Returns false when nobody is waiting, which is
    /// expected for duplicate deliveries and for completions of reclaimed
    /// async calls.
    pub fn resolve(&self, request_id: &str, reply: CallReply) -> bool {
        match self.waiters.lock().remove(request_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for a request id without resolving it.
    pub fn reclaim(&self, request_id: &str) {
        self.waiters.lock().remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(value: &[u8]) -> CallReply {
        CallReply {
            value: value.to_vec(),
            err_msg: None,
            node: "node-a".into(),
        }
    }

    #[tokio::test]
    async fn test_register_resolve() {
        let pending = PendingCalls::new();
        let rx = pending.register("r1");
        assert!(pending.resolve("r1", reply(b"ok")));
        assert_eq!(rx.await.unwrap().value, b"ok");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_silent() {
        let pending = PendingCalls::new();
        let rx = pending.register("r1");
        assert!(pending.resolve("r1", reply(b"first")));
        assert!(!pending.resolve("r1", reply(b"second")));
        assert_eq!(rx.await.unwrap().value, b"first");
    }

    #[tokio::test]
    async fn test_reclaim_drops_waiter() {
        let pending = PendingCalls::new();
        let rx = pending.register("r1");
        pending.reclaim("r1");
        assert!(rx.await.is_err());
        assert!(!pending.resolve("r1", reply(b"late")));
    }
}
