//! End-to-end engine tests against the in-memory broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::timeout;

use logrpc::rpc::assignment::{encode_meta, MemberMeta};
use logrpc::rpc::broker::{
    AssignmentCallback, MemberAssignment, MemberId, PartitionOffsets,
};
use logrpc::rpc::codec::encode_result;
use logrpc::rpc::message::now_unix;
use logrpc::rpc::placement::{alt_key, placement_key};
use logrpc::{
    Config, Engine, FailurePolicy, LogBroker, MemoryBroker, MemoryPlacementStore, Methods,
    Outcome, PlacementStore, RpcError, Target,
};

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Tests must see unrecoverable conditions as failures, not process exits.
struct PanicPolicy;

impl FailurePolicy for PanicPolicy {
    fn on_fatal(&self, reason: &str) {
        panic!("unrecoverable engine failure: {}", reason);
    }
}

fn config(topic: &str, node: &str) -> Config {
    let mut config = Config::new(topic);
    config.node_id = Some(node.to_string());
    config.failure_policy = Arc::new(PanicPolicy);
    config
}

async fn connect(
    topic: &str,
    node: &str,
    broker: &Arc<MemoryBroker>,
    store: &Arc<MemoryPlacementStore>,
) -> Engine {
    Engine::connect(
        config(topic, node),
        Arc::clone(broker) as Arc<dyn logrpc::LogBroker>,
        Arc::clone(store) as Arc<dyn logrpc::PlacementStore>,
    )
    .await
    .expect("connect")
}

/// Poll until the condition holds or the test times out.
async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn service(name: &str) -> Target {
    Target::Service {
        name: name.to_string(),
    }
}

fn session(name: &str, id: &str) -> Target {
    Target::Session {
        name: name.to_string(),
        id: id.to_string(),
        flow: "main".to_string(),
        deferred_lock_id: None,
    }
}

/// Group member that advertises metadata but never consumes anything,
/// modeling a node that crashes with work queued on its partition. The
/// engine that joined first computes all assignments, so this callback is
/// never invoked.
struct NullAssigner;

#[async_trait]
impl AssignmentCallback for NullAssigner {
    async fn assign(
        &self,
        _members: &BTreeMap<MemberId, Vec<u8>>,
        _partitions: &[i32],
        _offsets: &HashMap<i32, PartitionOffsets>,
    ) -> logrpc::Result<HashMap<MemberId, MemberAssignment>> {
        Ok(HashMap::new())
    }
}

fn zombie_meta(node_id: &str, services: &[&str]) -> Vec<u8> {
    encode_meta(&MemberMeta {
        node_id: node_id.to_string(),
        services: services.iter().map(|s| s.to_string()).collect(),
        partition: 0,
        claims_zero: false,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_round_trip() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("rt", "a", &broker, &store).await;

    engine.register_service(
        "incr",
        Methods::new().on("bump", |inbound| async move {
            Ok(Outcome::Reply(vec![inbound.value[0] + 1]))
        }),
    );

    let reply = timeout(
        Duration::from_secs(10),
        engine.call(service("incr"), "bump", vec![42], None),
    )
    .await
    .expect("call timed out")
    .expect("call failed");
    assert_eq!(reply, vec![43]);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_deadline_rejected() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("dl", "a", &broker, &store).await;

    engine.register_service(
        "echo",
        Methods::new().on("say", |inbound| async move { Ok(Outcome::Reply(inbound.value)) }),
    );

    let past = Some(now_unix() - 3600);
    let err = timeout(
        Duration::from_secs(10),
        engine.call(service("echo"), "say", vec![1], past),
    )
    .await
    .expect("call timed out")
    .expect_err("expired call must fail");
    assert!(
        err.to_string().contains("deadline expired"),
        "unexpected error: {}",
        err
    );

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undefined_method() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("um", "a", &broker, &store).await;

    engine.register_service(
        "svc",
        Methods::new().on("known", |_| async { Ok(Outcome::Reply(vec![])) }),
    );

    let err = timeout(
        Duration::from_secs(10),
        engine.call(service("svc"), "missing", vec![], None),
    )
    .await
    .expect("call timed out")
    .expect_err("unknown method must fail");
    assert!(
        err.to_string().contains("undefined method"),
        "unexpected error: {}",
        err
    );

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_calls_are_sticky_and_ordered() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("sess", "a", &broker, &store).await;

    let counts: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    let state = Arc::clone(&counts);
    engine.register_session(
        "counter",
        Methods::new().on("incr", move |inbound| {
            let state = Arc::clone(&state);
            async move {
                let id = match &inbound.target {
                    Target::Session { id, .. } => id.clone(),
                    _ => return Err("not a session".to_string()),
                };
                let next = {
                    let mut counts = state.lock();
                    let entry = counts.entry(id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                Ok(Outcome::Reply(next.to_be_bytes().to_vec()))
            }
        }),
    );

    let mut last = 0u64;
    for _ in 0..10 {
        let reply = timeout(
            Duration::from_secs(10),
            engine.call(session("counter", "c1"), "incr", vec![], None),
        )
        .await
        .expect("call timed out")
        .expect("call failed");
        last = u64::from_be_bytes(reply.try_into().expect("8 bytes"));
    }
    assert_eq!(last, 10);
    assert_eq!(counts.lock().get("c1"), Some(&10));

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replication_fallback_is_transparent() {
    init_tracing();
    // Single-broker "cluster": the preferred factor of 3 cannot be met.
    let broker = Arc::new(MemoryBroker::new(1));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("rf", "a", &broker, &store).await;

    engine.register_service(
        "echo",
        Methods::new().on("say", |inbound| async move { Ok(Outcome::Reply(inbound.value)) }),
    );

    let reply = timeout(
        Duration::from_secs(10),
        engine.call(service("echo"), "say", b"hi".to_vec(), None),
    )
    .await
    .expect("call timed out")
    .expect("call failed");
    assert_eq!(reply, b"hi");

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crash_recovery_completes_call() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(1));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("crash", "survivor", &broker, &store).await;

    let calls = Arc::new(Mutex::new(0u64));
    let state = Arc::clone(&calls);
    engine.register_session(
        "counter",
        Methods::new().on("incr", move |_| {
            let state = Arc::clone(&state);
            async move {
                *state.lock() += 1;
                Ok(Outcome::Reply(vec![1]))
            }
        }),
    );
    wait_for("service advertised", || {
        engine.topology().contains_key("counter")
    })
    .await;

    // A second member advertises the session type but never consumes,
    // modeling a node about to crash with work on its partition.
    let zombie = broker
        .join_group("crash", zombie_meta("zombie", &["counter"]), Arc::new(NullAssigner))
        .await
        .expect("zombie join");
    wait_for("zombie visible", || engine.node_ids().len() == 2).await;

    // Pin the session to the doomed node so the call lands on its partition.
    store
        .set(&placement_key("counter", "s1"), b"zombie")
        .await
        .expect("pin session");

    let caller = engine.clone();
    let call = tokio::spawn(async move {
        caller
            .call(session("counter", "s1"), "incr", vec![], None)
            .await
    });

    // Let the request reach the zombie's partition, then crash it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    broker.kill_member("crash", &zombie.member_id);

    let reply = timeout(Duration::from_secs(15), call)
        .await
        .expect("recovery timed out")
        .expect("join")
        .expect("recovered call failed");
    assert_eq!(reply, vec![1]);
    assert_eq!(*calls.lock(), 1);

    // The session moved off the dead node.
    let placed = store
        .get(&placement_key("counter", "s1"))
        .await
        .expect("placement")
        .expect("placed");
    assert_eq!(placed, b"survivor");

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_pinned_to_dead_node_fails() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(1));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("pin", "survivor", &broker, &store).await;
    engine.register_service(
        "noop",
        Methods::new().on("x", |_| async { Ok(Outcome::Reply(vec![])) }),
    );

    let zombie = broker
        .join_group("pin", zombie_meta("zombie", &[]), Arc::new(NullAssigner))
        .await
        .expect("zombie join");
    wait_for("zombie visible", || engine.node_ids().len() == 2).await;

    let caller = engine.clone();
    let call = tokio::spawn(async move {
        caller
            .call(
                Target::Node {
                    id: "zombie".to_string(),
                },
                "x",
                vec![],
                None,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    broker.kill_member("pin", &zombie.member_id);

    let err = timeout(Duration::from_secs(15), call)
        .await
        .expect("recovery timed out")
        .expect("join")
        .expect_err("pinned call must fail after the node died");
    assert!(
        err.to_string().contains("node died"),
        "unexpected error: {}",
        err
    );

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tell_runs_handler() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("tell", "a", &broker, &store).await;

    let hits = Arc::new(Mutex::new(0u64));
    let state = Arc::clone(&hits);
    engine.register_service(
        "mailer",
        Methods::new().on("send", move |_| {
            let state = Arc::clone(&state);
            async move {
                *state.lock() += 1;
                Ok(Outcome::Reply(vec![]))
            }
        }),
    );
    wait_for("service advertised", || {
        engine.topology().contains_key("mailer")
    })
    .await;

    timeout(
        Duration::from_secs(10),
        engine.tell(service("mailer"), "send", b"mail".to_vec(), None),
    )
    .await
    .expect("tell timed out")
    .expect("tell failed");

    wait_for("handler ran", || *hits.lock() == 1).await;

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_async_and_reclaim() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("async", "a", &broker, &store).await;

    engine.register_service(
        "echo",
        Methods::new().on("say", |inbound| async move { Ok(Outcome::Reply(inbound.value)) }),
    );
    wait_for("service advertised", || {
        engine.topology().contains_key("echo")
    })
    .await;

    let request_id = timeout(
        Duration::from_secs(10),
        engine.call_async(service("echo"), "say", b"later".to_vec(), None),
    )
    .await
    .expect("call_async timed out")
    .expect("call_async failed");

    let mut reply = None;
    for _ in 0..100 {
        if let Some(found) = engine.reclaim(&request_id).await.expect("reclaim") {
            reply = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(reply.expect("result never arrived"), b"later");

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redirect_keeps_request_id_and_increments_sequence() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("redir", "a", &broker, &store).await;

    let seen_hops = Arc::new(Mutex::new(Vec::<(String, u32)>::new()));

    let hops = Arc::clone(&seen_hops);
    engine.register_service(
        "front",
        Methods::new().on("go", move |inbound| {
            let hops = Arc::clone(&hops);
            async move {
                hops.lock().push((inbound.request_id.clone(), inbound.sequence));
                Ok(Outcome::Redirect(logrpc::Redirect {
                    target: Target::Service {
                        name: "back".to_string(),
                    },
                    method: "finish".to_string(),
                    value: inbound.value,
                    child_id: None,
                }))
            }
        }),
    );
    let hops = Arc::clone(&seen_hops);
    engine.register_service(
        "back",
        Methods::new().on("finish", move |inbound| {
            let hops = Arc::clone(&hops);
            async move {
                hops.lock().push((inbound.request_id.clone(), inbound.sequence));
                let mut out = inbound.value;
                out.push(b'!');
                Ok(Outcome::Reply(out))
            }
        }),
    );

    let reply = timeout(
        Duration::from_secs(10),
        engine.call(service("front"), "go", b"hop".to_vec(), None),
    )
    .await
    .expect("call timed out")
    .expect("call failed");
    assert_eq!(reply, b"hop!");

    let hops = seen_hops.lock();
    assert_eq!(hops.len(), 2);
    assert_eq!(hops[0].0, hops[1].0, "request id must be stable across hops");
    assert_eq!(hops[0].1, 0);
    assert_eq!(hops[1].1, 1, "sequence must increment by exactly one per hop");

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deadline_unblocks_call_with_no_route() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("noroute", "a", &broker, &store).await;

    // Nobody ever advertises this service; only the deadline can end the
    // routing wait.
    let soon = Some(now_unix() + 1);
    let err = timeout(
        Duration::from_secs(8),
        engine.call(service("nobody"), "x", vec![], soon),
    )
    .await
    .expect("deadline must unblock the routing wait")
    .expect_err("call with no route must fail");
    assert!(
        matches!(err, RpcError::DeadlineExpired),
        "unexpected error: {}",
        err
    );
    assert_eq!(engine.pending_calls(), 0);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_to_unknown_node_is_unavailable() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("ghost", "a", &broker, &store).await;

    engine.register_service(
        "noop",
        Methods::new().on("x", |_| async { Ok(Outcome::Reply(vec![])) }),
    );
    wait_for("generation applied", || !engine.node_ids().is_empty()).await;

    // No deadline: a node absent from a known generation must fail fast,
    // not block.
    let err = timeout(
        Duration::from_secs(8),
        engine.call(
            Target::Node {
                id: "ghost".to_string(),
            },
            "x",
            vec![],
            None,
        ),
    )
    .await
    .expect("routing must fail fast")
    .expect_err("unknown node must be unavailable");
    assert!(
        matches!(err, RpcError::Unavailable(_)),
        "unexpected error: {}",
        err
    );

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redirect_child_gate_delivers_parked_result() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("childok", "a", &broker, &store).await;

    // The nested call's result is already parked when the hop runs.
    store
        .set(&alt_key("child-7"), &encode_result(b"kid", None))
        .await
        .expect("park child result");

    engine.register_service(
        "front",
        Methods::new().on("go", |inbound| async move {
            Ok(Outcome::Redirect(logrpc::Redirect {
                target: Target::Service {
                    name: "back".to_string(),
                },
                method: "finish".to_string(),
                value: inbound.value,
                child_id: Some("child-7".to_string()),
            }))
        }),
    );
    engine.register_service(
        "back",
        Methods::new().on("finish", |inbound| async move {
            match inbound.child_result {
                Some((value, None)) => Ok(Outcome::Reply(value)),
                other => Err(format!("unexpected child result: {:?}", other)),
            }
        }),
    );

    let reply = timeout(
        Duration::from_secs(10),
        engine.call(service("front"), "go", vec![], None),
    )
    .await
    .expect("call timed out")
    .expect("call failed");
    assert_eq!(reply, b"kid");

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_gate_fails_hop_when_deadline_passes() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("childdl", "a", &broker, &store).await;

    let finished = Arc::new(Mutex::new(0u64));

    engine.register_service(
        "front",
        Methods::new().on("go", |inbound| async move {
            Ok(Outcome::Redirect(logrpc::Redirect {
                target: Target::Service {
                    name: "back".to_string(),
                },
                method: "finish".to_string(),
                value: inbound.value,
                // Never parked by anyone.
                child_id: Some("child-lost".to_string()),
            }))
        }),
    );
    let state = Arc::clone(&finished);
    engine.register_service(
        "back",
        Methods::new().on("finish", move |inbound| {
            let state = Arc::clone(&state);
            async move {
                *state.lock() += 1;
                Ok(Outcome::Reply(inbound.value))
            }
        }),
    );

    let err = timeout(
        Duration::from_secs(15),
        engine.call(service("front"), "go", vec![], Some(now_unix() + 2)),
    )
    .await
    .expect("deadline must unblock the child wait")
    .expect_err("hop without its child result must fail");
    assert!(
        err.to_string().contains("deadline expired"),
        "unexpected error: {}",
        err
    );
    // The handler never ran without its child result.
    assert_eq!(*finished.lock(), 0);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_session_lane_retires() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let mut cfg = config("lanes", "a");
    cfg.lane_idle_ms = 200;
    let engine = Engine::connect(
        cfg,
        Arc::clone(&broker) as Arc<dyn logrpc::LogBroker>,
        Arc::clone(&store) as Arc<dyn logrpc::PlacementStore>,
    )
    .await
    .expect("connect");

    engine.register_session(
        "counter",
        Methods::new().on("incr", |_| async { Ok(Outcome::Reply(vec![1])) }),
    );

    timeout(
        Duration::from_secs(10),
        engine.call(session("counter", "c1"), "incr", vec![], None),
    )
    .await
    .expect("call timed out")
    .expect("call failed");
    assert_eq!(engine.session_lanes(), 1);

    wait_for("idle lane retired", || engine.session_lanes() == 0).await;

    // A later call for the same session still works on a fresh lane.
    let reply = timeout(
        Duration::from_secs(10),
        engine.call(session("counter", "c1"), "incr", vec![], None),
    )
    .await
    .expect("call timed out")
    .expect("call failed");
    assert_eq!(reply, vec![1]);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_application_error_propagates() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new(3));
    let store = Arc::new(MemoryPlacementStore::new());
    let engine = connect("apperr", "a", &broker, &store).await;

    engine.register_service(
        "flaky",
        Methods::new().on("boom", |_| async { Err("kaboom".to_string()) }),
    );

    let err = timeout(
        Duration::from_secs(10),
        engine.call(service("flaky"), "boom", vec![], None),
    )
    .await
    .expect("call timed out")
    .expect_err("handler error must propagate");
    assert_eq!(err.to_string(), "kaboom");

    engine.shutdown();
}
