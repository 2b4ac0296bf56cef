//! Crash recovery replay
//!
//! After a dirty rebalance the recovery leader owns partition 0 plus every
//! non-empty partition whose owner died. It drains those backlogs up to the
//! offsets captured at assignment time, reconstructs the in-flight chains,
//! and decides per chain what survives:
//!
//! - a chain with an observed completion is finished and dropped
//! - an unfinished chain resumes from its latest hop, except chains carrying
//!   a lock continuation, which resume from their **earliest** surviving hop
//!   so the held lock is re-entered before anything that depends on it
//! - calls that can no longer reach their target (pinned to a dead node, or
//!   past their deadline) are answered with an error response instead
//! - responses stranded on a dead caller's partition are parked under their
//!   `alt_` key for a later reclaim
//!
//! Orphan partitions are truncated wholesale once the plan is executed.
//! Partition 0 is never truncated; progress on it is recorded as a head
//! offset instead.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::broker::{ConsumedRecord, PartitionOffsets};
use super::codec::decode;
use super::constants::{ERR_DEADLINE_EXPIRED, ERR_NODE_DIED};
use super::error::{Result, RpcError};
use super::message::{deadline_elapsed, Message, NodeId, RequestId, Target};

/// Drain each partition's channel up to the newest offset captured at
/// assignment time. Live records produced after the capture stay queued for
/// whoever owns the partition next generation.
pub async fn collect_backlog(
    channels: &mut HashMap<i32, mpsc::UnboundedReceiver<ConsumedRecord>>,
    bounds: &HashMap<i32, PartitionOffsets>,
) -> Result<Vec<ConsumedRecord>> {
    let mut collected = Vec::new();
    for (partition, rx) in channels.iter_mut() {
        let Some(range) = bounds.get(partition) else {
            continue;
        };
        if range.is_empty() {
            continue;
        }
        loop {
            let consumed = rx.recv().await.ok_or_else(|| {
                RpcError::Unavailable(format!(
                    "partition {} revoked during recovery",
                    partition
                ))
            })?;
            let offset = consumed.offset;
            collected.push(consumed);
            if offset >= range.newest - 1 {
                break;
            }
        }
    }
    Ok(collected)
}

/// Everything the replay planner needs to know about the dirty generation.
pub struct ReplayInput {
    /// Collected backlog: partition, offset, decoded message.
    pub records: Vec<(i32, i64, Message)>,
    /// Nodes in the current generation.
    pub live_nodes: HashSet<NodeId>,
    /// Partition-0 offset boundary already processed by earlier passes.
    pub head: i64,
    /// Offset bounds captured at assignment time, keyed by partition.
    pub bounds: HashMap<i32, PartitionOffsets>,
    /// The leader's own node id, stamped on synthesized error responses.
    pub local_node: NodeId,
}

/// The replay decision. Pure data; the engine executes it.
#[derive(Debug, Default, PartialEq)]
pub struct ReplayPlan {
    /// Requests to re-produce through normal routing.
    pub resend: Vec<Message>,
    /// Synthesized error responses for unroutable or expired calls, with the
    /// caller node they must reach.
    pub respond: Vec<(NodeId, Message)>,
    /// Responses whose caller died: parked as (request id, value, error).
    pub park: Vec<(RequestId, Vec<u8>, Option<String>)>,
    /// Tells dropped because their pinned node died or deadline passed.
    pub dropped_tells: Vec<RequestId>,
    /// Orphan partitions to truncate, as (partition, before-offset).
    /// Never contains partition 0.
    pub truncate: Vec<(i32, i64)>,
    /// New partition-0 head to record.
    pub new_head: i64,
    /// Request ids whose completion was observed, fed into the dedup set.
    pub seen: HashSet<RequestId>,
}

/// Decode raw collected records, skipping corrupt ones with a warning.
pub fn decode_backlog(collected: Vec<ConsumedRecord>) -> Vec<(i32, i64, Message)> {
    let mut out = Vec::with_capacity(collected.len());
    for consumed in collected {
        match decode(&consumed.record) {
            Ok(msg) => out.push((consumed.partition, consumed.offset, msg)),
            Err(err) => {
                warn!(
                    partition = consumed.partition,
                    offset = consumed.offset,
                    error = %err,
                    "skipping undecodable record during recovery"
                );
            }
        }
    }
    out
}

/// Compute the replay plan for a dirty generation.
pub fn plan_replay(input: &ReplayInput) -> ReplayPlan {
    let mut plan = ReplayPlan::default();

    // Pass 1: completions. Records on partition 0 below the recorded head
    // were already handled by an earlier pass and are ignored entirely.
    let relevant: Vec<&(i32, i64, Message)> = input
        .records
        .iter()
        .filter(|(partition, offset, _)| *partition != 0 || *offset >= input.head)
        .collect();

    let mut parked_responses: Vec<&Message> = Vec::new();
    for (_, _, msg) in &relevant {
        match msg {
            Message::Done { request_id } => {
                plan.seen.insert(request_id.clone());
            }
            Message::Response { request_id, .. } => {
                plan.seen.insert(request_id.clone());
                parked_responses.push(msg);
            }
            _ => {}
        }
    }

    // Responses stranded on a dead caller's partition: the waiter is gone,
    // but the result must survive for a reclaim.
    for msg in parked_responses {
        if let Message::Response {
            request_id,
            value,
            err_msg,
            ..
        } = msg
        {
            plan.park
                .push((request_id.clone(), value.clone(), err_msg.clone()));
        }
    }

    // Pass 2: group surviving request hops by chain.
    let mut chains: HashMap<&RequestId, Vec<&Message>> = HashMap::new();
    for (_, _, msg) in &relevant {
        if msg.is_request() && !plan.seen.contains(msg.request_id()) {
            chains.entry(msg.request_id()).or_default().push(msg);
        }
    }

    // Pass 3: pick each chain's resume hop and classify it.
    for (request_id, hops) in chains {
        let locked = hops
            .iter()
            .any(|m| m.target().is_some_and(|t| t.deferred_lock_id().is_some()));
        let resume = if locked {
            hops.iter().min_by_key(|m| m.sequence())
        } else {
            hops.iter().max_by_key(|m| m.sequence())
        };
        let Some(&resume) = resume else { continue };

        let dead_pin = match resume.target() {
            Some(Target::Node { id }) => !input.live_nodes.contains(id),
            _ => false,
        };
        let expired = deadline_elapsed(resume.deadline());

        match resume {
            Message::CallRequest { caller, .. } if dead_pin || expired => {
                let err = if dead_pin {
                    ERR_NODE_DIED
                } else {
                    ERR_DEADLINE_EXPIRED
                };
                debug!(request_id = %request_id, caller = %caller, error = err,
                    "failing unroutable call during recovery");
                plan.respond.push((
                    caller.clone(),
                    Message::Response {
                        request_id: request_id.clone(),
                        value: Vec::new(),
                        err_msg: Some(err.to_string()),
                        node: input.local_node.clone(),
                    },
                ));
            }
            Message::TellRequest { .. } if dead_pin || expired => {
                warn!(request_id = %request_id, "dropping undeliverable tell during recovery");
                plan.dropped_tells.push(request_id.clone());
            }
            _ => plan.resend.push(resume.clone()),
        }
    }

    // Orphan partitions are consumed in full; partition 0 only advances its
    // head marker.
    for (&partition, range) in &input.bounds {
        if partition == 0 {
            plan.new_head = plan.new_head.max(range.newest).max(input.head);
        } else if !range.is_empty() {
            plan.truncate.push((partition, range.newest));
        }
    }
    plan.new_head = plan.new_head.max(input.head);
    plan.truncate.sort_unstable();

    plan
}
