//! RPC engine
//!
//! Ties the broker, routing, placement, and recovery layers into the public
//! call/tell surface. One `Engine` is one node: it joins the application
//! topic's consumer group, owns exactly one home partition per clean
//! generation, dispatches every record produced to that partition, and
//! produces completions back to the requesting node's partition.
//!
//! Delivery is at-least-once. Duplicates are suppressed with two in-memory
//! sets: completed request ids, and seen `(request id, sequence)` hops.
//! Processed records on the home partition are acknowledged through a
//! contiguous watermark and physically truncated; partition 0 only ever
//! advances a recorded head offset.
//!
//! Session requests are serialized per session id through dedicated lanes;
//! service and node requests run concurrently.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, FailurePolicy};

use super::assignment::{encode_meta, parse_plan, read_head, EngineAssigner, MemberMeta};
use super::broker::{ConsumedRecord, GroupControl, GroupEvent, GroupSession, LogBroker};
use super::codec::{decode, decode_result, encode, encode_result};
use super::constants::{
    DEDUP_CAPACITY, ERR_DEADLINE_EXPIRED, ERR_UNDEFINED_METHOD, FALLBACK_REPLICATION_FACTOR,
    PARKED_POLL_INTERVAL_MS,
};
use super::error::{Result, RpcError};
use super::message::{
    deadline_elapsed, deadline_remaining, Deadline, Message, NodeId, RequestId, Target,
};
use super::pending::{CallReply, PendingCalls};
use super::placement::{alt_key, head_key, PlacementCache, PlacementStore};
use super::recovery::{collect_backlog, decode_backlog, plan_replay, ReplayInput};
use super::routing::{RoutingSnapshot, RoutingTable};

/// An incoming request as seen by a handler.
pub struct Inbound {
    pub request_id: RequestId,
    pub method: String,
    pub value: Vec<u8>,
    pub target: Target,
    /// Hop counter of the chain; 0 for the opening request, incremented by
    /// exactly one per redirect.
    pub sequence: u32,
    /// Result of the nested child call recorded on this hop, when any.
    pub child_result: Option<(Vec<u8>, Option<String>)>,
}

/// What a handler decided to do with a request.
pub enum Outcome {
    /// Terminate the chain with this payload.
    Reply(Vec<u8>),
    /// Forward the chain to another target under the same request id. The
    /// next hop's sequence increments by exactly one.
    Redirect(Redirect),
}

pub struct Redirect {
    pub target: Target,
    pub method: String,
    pub value: Vec<u8>,
    /// Nested blocking call this hop depends on; recovery resumes the chain
    /// only once its result is available.
    pub child_id: Option<RequestId>,
}

type HandlerFn =
    Arc<dyn Fn(Inbound) -> BoxFuture<'static, std::result::Result<Outcome, String>> + Send + Sync>;

/// Method table registered for a service, session type, or the node itself.
#[derive(Clone, Default)]
pub struct Methods {
    map: HashMap<String, HandlerFn>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Inbound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Outcome, String>> + Send + 'static,
    {
        self.map
            .insert(method.to_string(), Arc::new(move |inbound| handler(inbound).boxed()));
        self
    }

    fn get(&self, method: &str) -> Option<HandlerFn> {
        self.map.get(method).cloned()
    }
}

#[derive(Default)]
struct Registry {
    services: HashMap<String, Methods>,
    sessions: HashMap<String, Methods>,
    node: Methods,
}

impl Registry {
    fn lookup(&self, target: &Target, method: &str) -> Option<HandlerFn> {
        match target {
            Target::Service { name } => self.services.get(name)?.get(method),
            Target::Session { name, .. } => self.sessions.get(name)?.get(method),
            Target::Node { .. } => self.node.get(method),
        }
    }

    /// Names advertised to the group. Session types are advertised alongside
    /// services so placement can pick among their hosts.
    fn advertised(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .keys()
            .chain(self.sessions.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Contiguous acknowledgment watermark over one partition.
struct AckTracker {
    watermark: i64,
    acked: BTreeSet<i64>,
}

impl AckTracker {
    fn new(base: i64) -> Self {
        Self {
            watermark: base,
            acked: BTreeSet::new(),
        }
    }

    /// Record one processed offset; returns the new watermark when the
    /// contiguous prefix advanced.
    fn ack(&mut self, offset: i64) -> Option<i64> {
        if offset < self.watermark {
            return None;
        }
        self.acked.insert(offset);
        let before = self.watermark;
        while self.acked.remove(&self.watermark) {
            self.watermark += 1;
        }
        (self.watermark > before).then_some(self.watermark)
    }
}

/// Insertion-ordered set that evicts its oldest entries past a capacity.
/// Duplicate suppression for evicted entries degrades to the recovery head
/// boundary.
struct BoundedSet<T> {
    items: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns false when the value was already present.
    fn insert(&mut self, value: T) -> bool {
        if !self.items.insert(value.clone()) {
            return false;
        }
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.items.remove(&oldest);
            }
        }
        true
    }

    fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }
}

fn new_request_id() -> RequestId {
    Uuid::new_v4().to_string()
}

struct Inner {
    topic: String,
    node_id: NodeId,
    broker: Arc<dyn LogBroker>,
    store: Arc<dyn PlacementStore>,
    routing: RoutingTable,
    cache: Mutex<PlacementCache>,
    pending: PendingCalls,
    /// Receivers for calls issued with `call_async`, redeemed by `reclaim`.
    async_replies: Mutex<HashMap<RequestId, oneshot::Receiver<CallReply>>>,
    registry: RwLock<Registry>,
    /// Request hops already executed on this node.
    seen: Mutex<BoundedSet<(RequestId, u32)>>,
    /// Chains whose completion this node has observed.
    done: Mutex<BoundedSet<RequestId>>,
    /// Per-session serial dispatch lanes, keyed by (session type, id).
    /// Lanes retire after `lane_idle` without traffic.
    lanes: Mutex<HashMap<(String, String), mpsc::UnboundedSender<(Message, i32, i64)>>>,
    lane_idle: Duration,
    /// Send gate: ordinary sends hold the read side across the produce,
    /// generation application and the recovery pass hold the write side.
    send_gate: Arc<AsyncRwLock<()>>,
    control: OnceCell<Arc<dyn GroupControl>>,
    /// Home partition this generation, -1 before the first assignment.
    home: AtomicI32,
    claims_zero: AtomicBool,
    acks: Mutex<AckTracker>,
    root: CancellationToken,
    policy: Arc<dyn FailurePolicy>,
}

/// A connected RPC engine node. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create the application topic if needed and join its group.
    ///
    /// Topic creation prefers the configured replication factor and falls
    /// back to 1 when the cluster cannot satisfy it, so single-broker
    /// development environments work without configuration changes.
    pub async fn connect(
        config: Config,
        broker: Arc<dyn LogBroker>,
        store: Arc<dyn PlacementStore>,
    ) -> Result<Engine> {
        if let Err(err) = broker
            .create_topic(&config.topic, config.partitions, config.replication)
            .await
        {
            warn!(
                error = %err,
                replication = config.replication,
                "topic creation failed, retrying with replication factor 1"
            );
            broker
                .create_topic(&config.topic, config.partitions, FALLBACK_REPLICATION_FACTOR)
                .await?;
        }

        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", Uuid::new_v4()));

        let inner = Arc::new(Inner {
            topic: config.topic.clone(),
            node_id: node_id.clone(),
            broker: Arc::clone(&broker),
            store: Arc::clone(&store),
            routing: RoutingTable::new(),
            cache: Mutex::new(PlacementCache::new(config.session_cache_size)),
            pending: PendingCalls::new(),
            async_replies: Mutex::new(HashMap::new()),
            registry: RwLock::new(Registry::default()),
            seen: Mutex::new(BoundedSet::new(DEDUP_CAPACITY)),
            done: Mutex::new(BoundedSet::new(DEDUP_CAPACITY)),
            lanes: Mutex::new(HashMap::new()),
            lane_idle: Duration::from_millis(config.lane_idle_ms),
            send_gate: Arc::new(AsyncRwLock::new(())),
            control: OnceCell::new(),
            home: AtomicI32::new(-1),
            claims_zero: AtomicBool::new(false),
            acks: Mutex::new(AckTracker::new(0)),
            root: CancellationToken::new(),
            policy: Arc::clone(&config.failure_policy),
        });

        let assigner = Arc::new(EngineAssigner {
            broker,
            store,
            topic: config.topic.clone(),
        });
        let metadata = encode_meta(&inner.current_meta());
        let session = inner
            .broker
            .join_group(&config.topic, metadata, assigner)
            .await?;
        let _ = inner.control.set(Arc::clone(&session.control));
        info!(node = %node_id, topic = %config.topic, member = %session.member_id, "joined group");

        tokio::spawn(run(Arc::clone(&inner), session));
        Ok(Engine { inner })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Register a stateless service. Any replica registering the same name
    /// may receive its requests.
    pub fn register_service(&self, name: &str, methods: Methods) {
        self.inner
            .registry
            .write()
            .services
            .insert(name.to_string(), methods);
        self.inner.refresh_membership();
    }

    /// Register a session type. Requests for one session id are pinned to a
    /// single node and processed in order.
    pub fn register_session(&self, name: &str, methods: Methods) {
        self.inner
            .registry
            .write()
            .sessions
            .insert(name.to_string(), methods);
        self.inner.refresh_membership();
    }

    /// Register methods addressable on this node directly.
    pub fn register_node(&self, methods: Methods) {
        self.inner.registry.write().node = methods;
    }

    /// Issue a call and block until its response, cancellation, or deadline.
    pub async fn call(
        &self,
        target: Target,
        method: &str,
        value: Vec<u8>,
        deadline: Deadline,
    ) -> Result<Vec<u8>> {
        self.call_inner(target, method, value, deadline, None).await
    }

    /// Issue a call on behalf of an enclosing request, recording the
    /// parent/child relation for recovery replay ordering.
    pub async fn call_child(
        &self,
        parent_id: &str,
        target: Target,
        method: &str,
        value: Vec<u8>,
        deadline: Deadline,
    ) -> Result<Vec<u8>> {
        self.call_inner(target, method, value, deadline, Some(parent_id.to_string()))
            .await
    }

    async fn call_inner(
        &self,
        target: Target,
        method: &str,
        value: Vec<u8>,
        deadline: Deadline,
        parent_id: Option<RequestId>,
    ) -> Result<Vec<u8>> {
        let request_id = new_request_id();
        let rx = self.inner.pending.register(&request_id);
        let msg = Message::CallRequest {
            request_id: request_id.clone(),
            deadline,
            value,
            target,
            method: method.to_string(),
            caller: self.inner.node_id.clone(),
            sequence: 0,
            child_id: None,
            parent_id,
        };
        if let Err(err) = self.inner.send_bounded(&msg).await {
            self.inner.pending.reclaim(&request_id);
            return Err(err);
        }
        self.inner.await_reply(&request_id, rx, deadline).await
    }

    /// Issue a call without waiting. The result is collected later with
    /// [`Engine::reclaim`], possibly after this node recovered someone
    /// else's crash.
    pub async fn call_async(
        &self,
        target: Target,
        method: &str,
        value: Vec<u8>,
        deadline: Deadline,
    ) -> Result<RequestId> {
        let request_id = new_request_id();
        let rx = self.inner.pending.register(&request_id);
        let msg = Message::CallRequest {
            request_id: request_id.clone(),
            deadline,
            value,
            target,
            method: method.to_string(),
            caller: self.inner.node_id.clone(),
            sequence: 0,
            child_id: None,
            parent_id: None,
        };
        if let Err(err) = self.inner.send_bounded(&msg).await {
            self.inner.pending.reclaim(&request_id);
            return Err(err);
        }
        self.inner
            .async_replies
            .lock()
            .insert(request_id.clone(), rx);
        Ok(request_id)
    }

    /// Collect the result of an async call, checking the parked-result hints
    /// left by recovery for responses whose caller was unreachable. Returns
    /// `Ok(None)` when no result is available yet.
    pub async fn reclaim(&self, request_id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(mut rx) = self.inner.async_replies.lock().remove(request_id) {
            if let Ok(reply) = rx.try_recv() {
                return match reply.err_msg {
                    Some(err) => Err(RpcError::Application(err)),
                    None => Ok(Some(reply.value)),
                };
            }
        }
        self.inner.pending.reclaim(request_id);

        let key = alt_key(request_id);
        if let Some(raw) = self.inner.store.get(&key).await? {
            let (value, err_msg) = decode_result(&raw)?;
            let _ = self.inner.store.del(&key).await;
            return match err_msg {
                Some(err) => Err(RpcError::Application(err)),
                None => Ok(Some(value)),
            };
        }
        Ok(None)
    }

    /// Fire-and-forget request. Returns once the request is durably in the
    /// log; completion is tracked only for recovery bookkeeping.
    pub async fn tell(
        &self,
        target: Target,
        method: &str,
        value: Vec<u8>,
        deadline: Deadline,
    ) -> Result<RequestId> {
        let request_id = new_request_id();
        let msg = Message::TellRequest {
            request_id: request_id.clone(),
            deadline,
            value,
            target,
            method: method.to_string(),
            sequence: 0,
        };
        self.inner.send_bounded(&msg).await?;
        Ok(request_id)
    }

    /// Current service map: name to live hosting nodes.
    pub fn topology(&self) -> HashMap<String, Vec<NodeId>> {
        self.inner.routing.topology()
    }

    /// Live node ids in the current generation.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner.routing.node_ids()
    }

    /// Home partition of a live node, if known.
    pub fn node_partition(&self, node: &str) -> Option<i32> {
        self.inner.routing.lookup_node(node)
    }

    /// All partition ids of the application topic.
    pub async fn partitions(&self) -> Result<Vec<i32>> {
        self.inner.broker.partitions(&self.inner.topic).await
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of live per-session dispatch lanes.
    pub fn session_lanes(&self) -> usize {
        self.inner.lanes.lock().len()
    }

    /// Leave the group and cancel all in-flight waits.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        if let Some(control) = self.inner.control.get() {
            control.leave();
        }
    }
}

impl Inner {
    fn current_meta(&self) -> MemberMeta {
        MemberMeta {
            node_id: self.node_id.clone(),
            services: self.registry.read().advertised(),
            partition: self.home.load(Ordering::SeqCst).max(0),
            claims_zero: self.claims_zero.load(Ordering::SeqCst),
        }
    }

    /// Push fresh metadata and force a rebalance so new registrations get
    /// advertised to the group.
    fn refresh_membership(&self) {
        if let Some(control) = self.control.get() {
            control.update_metadata(encode_meta(&self.current_meta()));
            control.rejoin();
        }
    }

    async fn produce(&self, partition: i32, msg: &Message) -> Result<i64> {
        self.broker.produce(&self.topic, partition, encode(msg)).await
    }

    /// Resolve a request's destination node and partition by target kind,
    /// blocking on the routing tick until a viable destination exists.
    async fn route_request(&self, ctx: &CancellationToken, msg: &Message) -> Result<(NodeId, i32)> {
        let target = msg
            .target()
            .ok_or_else(|| RpcError::Unavailable("message has no target".into()))?;
        match target {
            Target::Service { name } => self.routing.route_to_service(ctx, name).await,
            Target::Session { name, id, .. } => {
                self.routing
                    .route_to_session(ctx, self.store.as_ref(), &self.cache, name, id)
                    .await
            }
            Target::Node { id } => Ok((id.clone(), self.routing.route_to_node(ctx, id).await?)),
        }
    }

    /// Route a request and produce it without taking the send gate. The
    /// recovery pass uses this while it holds the gate's write side.
    async fn send_request(&self, ctx: &CancellationToken, msg: &Message) -> Result<()> {
        let (_, partition) = self.route_request(ctx, msg).await?;
        self.produce(partition, msg).await?;
        Ok(())
    }

    /// Gated send. Routing waits happen outside the gate; the produce holds
    /// the read side, and the resolved route is checked again under the gate
    /// so a send resolved against a stale table cannot land on a partition
    /// that recovery just orphaned.
    async fn send_gated(&self, ctx: &CancellationToken, msg: &Message) -> Result<()> {
        loop {
            let (node, partition) = self.route_request(ctx, msg).await?;
            let _gate = self.send_gate.read().await;
            if self.routing.lookup_node(&node) != Some(partition) {
                continue;
            }
            self.produce(partition, msg).await?;
            return Ok(());
        }
    }

    /// Gated send bounded by the message's own deadline and engine shutdown.
    /// A send still blocked in routing when the deadline passes fails with
    /// `DeadlineExpired` instead of waiting for a route that may never come.
    async fn send_bounded(&self, msg: &Message) -> Result<()> {
        let ctx = self.root.child_token();
        match deadline_remaining(msg.deadline()) {
            Some(remaining) => {
                tokio::select! {
                    sent = self.send_gated(&ctx, msg) => sent,
                    _ = tokio::time::sleep(remaining) => {
                        ctx.cancel();
                        Err(RpcError::DeadlineExpired)
                    }
                }
            }
            None => self.send_gated(&ctx, msg).await,
        }
    }

    /// Deliver a response to the caller's partition, or park it under the
    /// request's `alt_` key when the caller is not currently routable.
    async fn send_response(&self, caller: &str, msg: &Message) {
        match self.routing.lookup_node(caller) {
            Some(partition) => {
                if let Err(err) = self.produce(partition, msg).await {
                    self.fatal_or_warn(err, "produce response");
                }
            }
            None => {
                if let Message::Response {
                    request_id,
                    value,
                    err_msg,
                    ..
                } = msg
                {
                    debug!(request_id = %request_id, caller, "caller unroutable, parking response");
                    let parked = encode_result(value, err_msg.as_deref());
                    if let Err(err) = self.store.set(&alt_key(request_id), &parked).await {
                        self.fatal_or_warn(err, "park response");
                    }
                }
            }
        }
    }

    /// Record a chain as complete on partition 0.
    async fn send_done(&self, request_id: &str) {
        let msg = Message::Done {
            request_id: request_id.to_string(),
        };
        if let Err(err) = self.produce(0, &msg).await {
            self.fatal_or_warn(err, "produce completion marker");
        }
    }

    /// A failed completion produce leaves a caller blocked forever; only a
    /// survivable failure (the caller is gone anyway) is tolerated.
    fn fatal_or_warn(&self, err: RpcError, operation: &str) {
        if err.is_survivable_send_failure() {
            warn!(error = %err, operation, "send failed");
        } else {
            self.policy
                .on_fatal(&format!("{}: {}", operation, err));
        }
    }

    async fn await_reply(
        &self,
        request_id: &str,
        mut rx: oneshot::Receiver<CallReply>,
        deadline: Deadline,
    ) -> Result<Vec<u8>> {
        let mut tick = self.routing.subscribe();
        loop {
            tokio::select! {
                reply = &mut rx => {
                    return match reply {
                        Ok(CallReply { err_msg: Some(err), .. }) => Err(RpcError::Application(err)),
                        Ok(CallReply { value, .. }) => Ok(value),
                        Err(_) => Err(RpcError::Closed),
                    };
                }
                _ = self.root.cancelled() => {
                    self.pending.reclaim(request_id);
                    return Err(RpcError::Canceled);
                }
                _ = tick.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(PARKED_POLL_INTERVAL_MS)) => {}
            }

            if deadline_elapsed(deadline) {
                self.pending.reclaim(request_id);
                return Err(RpcError::DeadlineExpired);
            }

            // The response may have been parked rather than produced, e.g.
            // when it was synthesized while this node looked dead.
            if let Ok(Some(raw)) = self.store.get(&alt_key(request_id)).await {
                if let Ok((value, err_msg)) = decode_result(&raw) {
                    let _ = self.store.del(&alt_key(request_id)).await;
                    self.pending.reclaim(request_id);
                    return match err_msg {
                        Some(err) => Err(RpcError::Application(err)),
                        None => Ok(value),
                    };
                }
            }
        }
    }

    /// Entry point for every record consumed from an owned partition.
    async fn handle_record(self: &Arc<Self>, consumed: ConsumedRecord) {
        let partition = consumed.partition;
        let offset = consumed.offset;
        let msg = match decode(&consumed.record) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(partition, offset, error = %err, "skipping undecodable record");
                self.ack(partition, offset).await;
                return;
            }
        };

        match msg {
            Message::Response {
                request_id,
                value,
                err_msg,
                node,
            } => {
                let resolved = self.pending.resolve(
                    &request_id,
                    CallReply {
                        value: value.clone(),
                        err_msg: err_msg.clone(),
                        node,
                    },
                );
                if !resolved && !self.done.lock().contains(&request_id) {
                    // Unsolicited response, e.g. the result of a child call
                    // whose originating hop moved to another node. Park it so
                    // the resumed hop can find it.
                    let parked = encode_result(&value, err_msg.as_deref());
                    if let Err(err) = self.store.set(&alt_key(&request_id), &parked).await {
                        warn!(request_id = %request_id, error = %err, "failed to park response");
                    }
                }
                self.done.lock().insert(request_id);
                self.ack(partition, offset).await;
            }
            Message::Done { request_id } => {
                // Completion markers live on partition 0, which is never
                // acknowledged or truncated.
                self.done.lock().insert(request_id);
            }
            request => self.dispatch_request(request, partition, offset),
        }
    }

    /// Session requests go through a per-session serial lane; everything
    /// else runs concurrently. Sending happens under the lanes lock, which
    /// pairs with lane retirement: a lane only retires after observing an
    /// empty queue under that same lock, so no job is ever lost to a racing
    /// retirement.
    fn dispatch_request(self: &Arc<Self>, msg: Message, partition: i32, offset: i64) {
        if let Some(Target::Session { name, id, .. }) = msg.target() {
            let key = (name.clone(), id.clone());
            let mut job = (msg, partition, offset);
            loop {
                let mut lanes = self.lanes.lock();
                let tx = lanes
                    .entry(key.clone())
                    .or_insert_with(|| self.spawn_lane(key.clone()))
                    .clone();
                match tx.send(job) {
                    Ok(()) => return,
                    Err(err) => {
                        // The lane retired between lookup and send.
                        lanes.remove(&key);
                        job = err.0;
                    }
                }
            }
        } else {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.handle_request(msg, partition, offset).await;
            });
        }
    }

    /// Spawn a serial dispatch lane for one session. The lane retires itself
    /// after sitting idle, removing its map entry before exiting.
    fn spawn_lane(
        self: &Arc<Self>,
        key: (String, String),
    ) -> mpsc::UnboundedSender<(Message, i32, i64)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Message, i32, i64)>();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = inner.root.cancelled() => break,
                    job = tokio::time::timeout(inner.lane_idle, rx.recv()) => match job {
                        Ok(Some(job)) => job,
                        Ok(None) => break,
                        Err(_) => {
                            // Idle. Retire unless a job raced in; the queue
                            // check and the removal share the dispatch lock.
                            let mut lanes = inner.lanes.lock();
                            match rx.try_recv() {
                                Ok(job) => job,
                                Err(_) => {
                                    lanes.remove(&key);
                                    break;
                                }
                            }
                        }
                    },
                };
                let (msg, partition, offset) = job;
                inner.handle_request(msg, partition, offset).await;
            }
        });
        tx
    }

    async fn handle_request(self: &Arc<Self>, msg: Message, partition: i32, offset: i64) {
        let request_id = msg.request_id().clone();
        let sequence = msg.sequence().unwrap_or(0);

        let duplicate = self.done.lock().contains(&request_id)
            || !self.seen.lock().insert((request_id.clone(), sequence));
        if duplicate {
            self.ack(partition, offset).await;
            return;
        }

        let (deadline, value, target, method, caller, child_id, parent_id) = match msg {
            Message::CallRequest {
                deadline,
                value,
                target,
                method,
                caller,
                child_id,
                parent_id,
                ..
            } => (deadline, value, target, method, Some(caller), child_id, parent_id),
            Message::TellRequest {
                deadline,
                value,
                target,
                method,
                ..
            } => (deadline, value, target, method, None, None, None),
            _ => {
                self.ack(partition, offset).await;
                return;
            }
        };

        // Deadlines are judged at dequeue time, by the consumer's clock.
        if deadline_elapsed(deadline) {
            debug!(request_id = %request_id, method = %method, "dropping expired request");
            if let Some(caller) = &caller {
                self.send_response(
                    caller,
                    &Message::Response {
                        request_id: request_id.clone(),
                        value: Vec::new(),
                        err_msg: Some(ERR_DEADLINE_EXPIRED.to_string()),
                        node: self.node_id.clone(),
                    },
                )
                .await;
            }
            self.finish(&request_id, partition, offset).await;
            return;
        }

        let handler = self.registry.read().lookup(&target, &method);
        let Some(handler) = handler else {
            warn!(method = %method, "request for unregistered method");
            if let Some(caller) = &caller {
                self.send_response(
                    caller,
                    &Message::Response {
                        request_id: request_id.clone(),
                        value: Vec::new(),
                        err_msg: Some(ERR_UNDEFINED_METHOD.to_string()),
                        node: self.node_id.clone(),
                    },
                )
                .await;
            }
            self.finish(&request_id, partition, offset).await;
            return;
        };

        let child_result = match &child_id {
            Some(child) => match self.await_parked(child, deadline).await {
                Ok(found) => Some(found),
                Err(RpcError::Canceled) => return,
                Err(err) => {
                    warn!(
                        request_id = %request_id,
                        child = %child,
                        error = %err,
                        "child result unavailable, failing hop"
                    );
                    if let Some(caller) = &caller {
                        self.send_response(
                            caller,
                            &Message::Response {
                                request_id: request_id.clone(),
                                value: Vec::new(),
                                err_msg: Some(err.to_string()),
                                node: self.node_id.clone(),
                            },
                        )
                        .await;
                    }
                    self.finish(&request_id, partition, offset).await;
                    return;
                }
            },
            None => None,
        };

        let inbound = Inbound {
            request_id: request_id.clone(),
            method: method.clone(),
            value,
            target: target.clone(),
            sequence,
            child_result,
        };

        match handler(inbound).await {
            Ok(Outcome::Reply(value)) => {
                if let Some(caller) = &caller {
                    self.send_response(
                        caller,
                        &Message::Response {
                            request_id: request_id.clone(),
                            value,
                            err_msg: None,
                            node: self.node_id.clone(),
                        },
                    )
                    .await;
                }
                self.finish(&request_id, partition, offset).await;
            }
            Ok(Outcome::Redirect(next)) => {
                let forward = match &caller {
                    Some(caller) => Message::CallRequest {
                        request_id: request_id.clone(),
                        deadline,
                        value: next.value,
                        target: next.target,
                        method: next.method,
                        caller: caller.clone(),
                        sequence: sequence + 1,
                        child_id: next.child_id,
                        parent_id,
                    },
                    None => Message::TellRequest {
                        request_id: request_id.clone(),
                        deadline,
                        value: next.value,
                        target: next.target,
                        method: next.method,
                        sequence: sequence + 1,
                    },
                };
                if let Err(err) = self.send_bounded(&forward).await {
                    warn!(request_id = %request_id, error = %err, "failed to forward chain");
                    if let Some(caller) = &caller {
                        self.send_response(
                            caller,
                            &Message::Response {
                                request_id: request_id.clone(),
                                value: Vec::new(),
                                err_msg: Some(err.to_string()),
                                node: self.node_id.clone(),
                            },
                        )
                        .await;
                    }
                }
                // The chain continues; no completion marker yet.
                self.ack(partition, offset).await;
            }
            Err(app_err) => {
                if let Some(caller) = &caller {
                    self.send_response(
                        caller,
                        &Message::Response {
                            request_id: request_id.clone(),
                            value: Vec::new(),
                            err_msg: Some(app_err),
                            node: self.node_id.clone(),
                        },
                    )
                    .await;
                } else {
                    warn!(request_id = %request_id, error = %app_err, "tell handler failed");
                }
                self.finish(&request_id, partition, offset).await;
            }
        }
    }

    /// Mark a chain complete and acknowledge the record that ended it.
    async fn finish(&self, request_id: &str, partition: i32, offset: i64) {
        self.done.lock().insert(request_id.to_string());
        self.send_done(request_id).await;
        self.ack(partition, offset).await;
    }

    /// Wait for a parked child result. A hop recording a nested call does
    /// not run until that call's result is available; the wait is bounded
    /// only by the request's own deadline and engine shutdown, and a hop
    /// whose child result never arrives fails rather than running without
    /// it.
    async fn await_parked(
        &self,
        request_id: &str,
        deadline: Deadline,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let key = alt_key(request_id);
        loop {
            if let Some(raw) = self.store.get(&key).await? {
                let found = decode_result(&raw)?;
                let _ = self.store.del(&key).await;
                return Ok(found);
            }
            if deadline_elapsed(deadline) {
                return Err(RpcError::DeadlineExpired);
            }
            tokio::select! {
                _ = self.root.cancelled() => return Err(RpcError::Canceled),
                _ = tokio::time::sleep(Duration::from_millis(PARKED_POLL_INTERVAL_MS)) => {}
            }
        }
    }

    /// Acknowledge a processed record on the home partition and truncate the
    /// contiguous prefix. Other partitions are left alone.
    async fn ack(&self, partition: i32, offset: i64) {
        if partition != self.home.load(Ordering::SeqCst) {
            return;
        }
        let advanced = self.acks.lock().ack(offset);
        if let Some(watermark) = advanced {
            if let Err(err) = self
                .broker
                .delete_records(&self.topic, partition, watermark)
                .await
            {
                warn!(partition, error = %err, "failed to truncate acknowledged records");
            }
        }
    }

    /// Lead the recovery pass for a dirty generation. Holds the send gate's
    /// write side for the whole pass, so no ordinary send can produce while
    /// orphaned partitions are being replayed and truncated.
    async fn recover(
        self: Arc<Self>,
        ctx: CancellationToken,
        mut channels: HashMap<i32, mpsc::UnboundedReceiver<ConsumedRecord>>,
        routes: RoutingSnapshot,
        gate: OwnedRwLockWriteGuard<()>,
    ) {
        // Own traffic keeps flowing while the orphans are replayed.
        let home = self.home.load(Ordering::SeqCst);
        if let Some(rx) = channels.remove(&home) {
            match self.broker.offsets(&self.topic, home).await {
                Ok(bounds) => *self.acks.lock() = AckTracker::new(bounds.oldest),
                Err(err) => warn!(error = %err, "failed to read home partition offsets"),
            }
            tokio::spawn(consume_loop(Arc::clone(&self), ctx.clone(), home, rx));
        }

        if let Err(err) = self.run_recovery(&ctx, channels, &routes).await {
            warn!(error = %err, "recovery pass failed, rejoining for another attempt");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        drop(gate);
        if let Some(control) = self.control.get() {
            control.rejoin();
        }
    }

    async fn run_recovery(
        &self,
        ctx: &CancellationToken,
        mut channels: HashMap<i32, mpsc::UnboundedReceiver<ConsumedRecord>>,
        routes: &RoutingSnapshot,
    ) -> Result<()> {
        let mut bounds = HashMap::new();
        for &partition in channels.keys() {
            bounds.insert(partition, self.broker.offsets(&self.topic, partition).await?);
        }
        let head = read_head(self.store.as_ref(), &self.topic).await?;

        let collected = collect_backlog(&mut channels, &bounds).await?;
        let records = decode_backlog(collected);
        info!(records = records.len(), head, "replaying in-flight chains");

        let plan = plan_replay(&ReplayInput {
            records,
            live_nodes: routes.nodes.keys().cloned().collect(),
            head,
            bounds,
            local_node: self.node_id.clone(),
        });

        for (request_id, value, err_msg) in &plan.park {
            self.store
                .set(&alt_key(request_id), &encode_result(value, err_msg.as_deref()))
                .await?;
        }
        {
            let mut done = self.done.lock();
            for request_id in &plan.seen {
                done.insert(request_id.clone());
            }
        }
        for (caller, msg) in &plan.respond {
            self.send_response(caller, msg).await;
        }
        for msg in &plan.resend {
            self.send_request(ctx, msg).await?;
        }
        for &(partition, before) in &plan.truncate {
            self.broker
                .delete_records(&self.topic, partition, before)
                .await?;
        }
        self.store
            .set(&head_key(&self.topic), plan.new_head.to_string().as_bytes())
            .await?;

        info!(
            resent = plan.resend.len(),
            failed = plan.respond.len(),
            parked = plan.park.len(),
            dropped = plan.dropped_tells.len(),
            head = plan.new_head,
            "recovery pass complete"
        );
        Ok(())
    }
}

async fn consume_loop(
    inner: Arc<Inner>,
    ctx: CancellationToken,
    partition: i32,
    mut rx: mpsc::UnboundedReceiver<ConsumedRecord>,
) {
    debug!(partition, "consuming");
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            consumed = rx.recv() => match consumed {
                Some(consumed) => inner.handle_record(consumed).await,
                None => break,
            }
        }
    }
    debug!(partition, "consume loop stopped");
}

/// Group event loop: reacts to revocations and new generations for the
/// engine's whole lifetime.
async fn run(inner: Arc<Inner>, mut session: GroupSession) {
    let mut generation_ctx = inner.root.child_token();
    loop {
        let event = tokio::select! {
            _ = inner.root.cancelled() => break,
            event = session.events.recv() => match event {
                Some(event) => event,
                None => break,
            }
        };

        match event {
            GroupEvent::Revoked => {
                generation_ctx.cancel();
            }
            GroupEvent::Assigned {
                generation,
                partitions,
                data,
                channels,
            } => {
                generation_ctx = inner.root.child_token();
                let (routes, dirty, leader) = match parse_plan(&data) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(generation, error = %err, "ignoring malformed assignment data");
                        continue;
                    }
                };

                // Sends pause while the new generation's routes are applied;
                // the leader keeps the write side for its whole recovery
                // pass.
                let gate = Arc::clone(&inner.send_gate).write_owned().await;

                let home = routes.nodes.get(&inner.node_id).copied().unwrap_or(-1);
                inner.home.store(home, Ordering::SeqCst);
                inner
                    .claims_zero
                    .store(partitions.contains(&0), Ordering::SeqCst);
                if let Some(control) = inner.control.get() {
                    control.update_metadata(encode_meta(&inner.current_meta()));
                }

                if dirty {
                    let live: HashSet<NodeId> = routes.nodes.keys().cloned().collect();
                    inner.routing.prune(&live);
                    if leader == inner.node_id {
                        info!(generation, "dirty generation, leading recovery");
                        tokio::spawn(Arc::clone(&inner).recover(
                            generation_ctx.clone(),
                            channels,
                            routes,
                            gate,
                        ));
                    } else {
                        debug!(generation, leader = %leader, "dirty generation, awaiting recovery");
                    }
                } else {
                    inner.routing.replace(routes);
                    if home >= 0 {
                        match inner.broker.offsets(&inner.topic, home).await {
                            Ok(bounds) => *inner.acks.lock() = AckTracker::new(bounds.oldest),
                            Err(err) => {
                                warn!(error = %err, home, "failed to read home partition offsets")
                            }
                        }
                    }
                    for (partition, rx) in channels {
                        tokio::spawn(consume_loop(
                            Arc::clone(&inner),
                            generation_ctx.clone(),
                            partition,
                            rx,
                        ));
                    }
                    info!(generation, home, "joined clean generation");
                }
            }
        }
    }
    debug!(node = %inner.node_id, "engine event loop stopped");
}
