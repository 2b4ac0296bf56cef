//! Logical message model
//!
//! Every record on the application topic decodes into one of four message
//! variants. `CallRequest`/`TellRequest` open a chain identified by a stable
//! `RequestId`; `Response`/`Done` terminate it. `sequence` counts tail-call
//! hops of the same request id and increments by exactly one per forward.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Globally unique, opaque request identity. Stable across tail-call hops.
pub type RequestId = String;

/// Process-lifetime node identity.
pub type NodeId = String;

/// Discriminated destination of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Stateless: any replica currently hosting the service may handle it.
    Service { name: String },
    /// Sticky and ordered per id: pinned to exactly one node at a time.
    Session {
        name: String,
        id: String,
        flow: String,
        /// Marks a chain that must resume from its earliest unacknowledged
        /// hop during recovery, because it carries a held lock continuation.
        deferred_lock_id: Option<String>,
    },
    /// Pinned to one specific process.
    Node { id: NodeId },
}

/// Target discriminant, used as half of the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Service,
    Session,
    Node,
}

impl Target {
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Service { .. } => TargetKind::Service,
            Target::Session { .. } => TargetKind::Session,
            Target::Node { .. } => TargetKind::Node,
        }
    }

    /// Lock continuation marker, present only on some Session targets.
    pub fn deferred_lock_id(&self) -> Option<&str> {
        match self {
            Target::Session {
                deferred_lock_id, ..
            } => deferred_lock_id.as_deref(),
            _ => None,
        }
    }
}

/// Advisory wall-clock deadline, unix seconds. Checked at dequeue time, not
/// at send time, tolerating producer/consumer clock skew.
pub type Deadline = Option<u64>;

/// Current wall clock as unix seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether a deadline has already elapsed.
pub fn deadline_elapsed(deadline: Deadline) -> bool {
    matches!(deadline, Some(d) if d <= now_unix())
}

/// Time left until a deadline; `None` when no deadline is set, zero when it
/// already passed.
pub fn deadline_remaining(deadline: Deadline) -> Option<Duration> {
    deadline.map(|d| Duration::from_secs(d.saturating_sub(now_unix())))
}

/// The four logical message kinds carried on the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Expects a `Response` routed back to `caller`.
    CallRequest {
        request_id: RequestId,
        deadline: Deadline,
        value: Vec<u8>,
        target: Target,
        method: String,
        caller: NodeId,
        sequence: u32,
        /// Nested blocking sub-request that must complete before this hop's
        /// side effects are final. Used only for recovery replay ordering.
        child_id: Option<RequestId>,
        parent_id: Option<RequestId>,
    },
    /// Expects only a `Done` acknowledgment, no payload returned.
    TellRequest {
        request_id: RequestId,
        deadline: Deadline,
        value: Vec<u8>,
        target: Target,
        method: String,
        sequence: u32,
    },
    /// Terminal answer to a `CallRequest` chain.
    Response {
        request_id: RequestId,
        value: Vec<u8>,
        err_msg: Option<String>,
        node: NodeId,
    },
    /// Terminal acknowledgment of a `TellRequest` chain.
    Done { request_id: RequestId },
}

impl Message {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Message::CallRequest { request_id, .. }
            | Message::TellRequest { request_id, .. }
            | Message::Response { request_id, .. }
            | Message::Done { request_id } => request_id,
        }
    }

    /// Hop counter for requests; completions have no sequence.
    pub fn sequence(&self) -> Option<u32> {
        match self {
            Message::CallRequest { sequence, .. } | Message::TellRequest { sequence, .. } => {
                Some(*sequence)
            }
            _ => None,
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            Message::CallRequest { target, .. } | Message::TellRequest { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    pub fn deadline(&self) -> Deadline {
        match self {
            Message::CallRequest { deadline, .. } | Message::TellRequest { deadline, .. } => {
                *deadline
            }
            _ => None,
        }
    }

    /// True for `Response`/`Done`, the two chain-terminating variants.
    pub fn is_completion(&self) -> bool {
        matches!(self, Message::Response { .. } | Message::Done { .. })
    }

    pub fn is_request(&self) -> bool {
        !self.is_completion()
    }
}
