//! Integration Tests for the Dependency Graph
//!
//! These tests drive nodes, resource nodes and the watch shim together and
//! check the propagation guarantees end to end.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tracing_subscriber::EnvFilter;

use cascade_core::graph::{Compute, Node, NodeEvent};
use cascade_core::watch::{Change, ManualBackend, WatchShim};
use cascade_core::{CascadeConfig, Encoding, JsonNode, ResourceRegistry, Result, Value, WatchOptions};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A leaf whose value is whatever `source` holds when it derives.
fn reading(source: &Arc<AtomicI64>) -> Node {
    let source = source.clone();
    Node::from_fn(move |_| Ok(Value::from(source.load(Ordering::SeqCst))))
}

/// Derives `"b" + child`, but each derivation first takes a permit from
/// `gate`, so a test can hold it mid-flight.
struct Gated {
    calls: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
}

impl Compute for Gated {
    fn kind(&self) -> &'static str {
        "Gated"
    }

    fn derive<'a>(&'a self, inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(Value::from(format!("b{}", inputs[0])))
        })
    }
}

/// Records every value the node settles on, and whether any child was dirty
/// at that moment.
fn record_updates(node: &Node) -> (Arc<Mutex<Vec<Value>>>, Arc<AtomicUsize>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let premature = Arc::new(AtomicUsize::new(0));

    let (log, bad) = (updates.clone(), premature.clone());
    let children = node.children();
    node.subscribe(move |event| {
        if let NodeEvent::Update(value) = event {
            if children.iter().any(Node::is_dirty) {
                bad.fetch_add(1, Ordering::SeqCst);
            }
            log.lock().push(value.clone());
        }
    });
    (updates, premature)
}

/// Scenario A: a child change reaches the parent with one more derivation.
#[tokio::test]
async fn parent_follows_child_counter() {
    init_tracing();
    let counter = Arc::new(AtomicI64::new(0));
    let next = counter.clone();
    let child = Node::from_fn(move |_| Ok(Value::from(next.fetch_add(1, Ordering::SeqCst))));

    let derivations = Arc::new(AtomicUsize::new(0));
    let count = derivations.clone();
    let parent = Node::from_fn(move |inputs| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(Value::from(format!("a{}", inputs[0])))
    });
    parent.add_child(&child);

    parent.init().await.unwrap();
    assert_eq!(child.cached(), Some(Value::from(0)));
    assert_eq!(parent.cached(), Some(Value::from("a0")));
    assert_eq!(derivations.load(Ordering::SeqCst), 1);

    child.dirty().await.unwrap();
    let value = tokio::time::timeout(Duration::from_secs(5), parent.settled())
        .await
        .unwrap();
    assert_eq!(value, Some(Value::from("a1")));
    assert_eq!(derivations.load(Ordering::SeqCst), 2);
}

/// Scenario B: two child changes during one parent derivation cost exactly
/// one extra derivation, which sees both.
#[tokio::test]
async fn changes_during_derivation_coalesce() {
    init_tracing();
    let source = Arc::new(AtomicI64::new(0));
    let child = reading(&source);

    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(1));
    let parent = Node::new(Gated {
        calls: calls.clone(),
        gate: gate.clone(),
    });
    parent.add_child(&child);
    parent.init().await.unwrap();
    assert_eq!(parent.cached(), Some(Value::from("b0")));
    let (updates, premature) = record_updates(&parent);
    let baseline = calls.load(Ordering::SeqCst);

    source.store(1, Ordering::SeqCst);
    child.dirty().await.unwrap();
    wait_until(|| parent.is_updating()).await;

    source.store(2, Ordering::SeqCst);
    child.dirty().await.unwrap();
    assert!(parent.is_dirty());
    assert_eq!(calls.load(Ordering::SeqCst) - baseline, 1);

    gate.add_permits(8);
    wait_until(|| !updates.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst) - baseline, 2);
    assert_eq!(*updates.lock(), vec![Value::from("b2")]);
    assert_eq!(premature.load(Ordering::SeqCst), 0);
}

/// P1: any burst of changes during a derivation ends in exactly one update
/// carrying the latest value.
#[tokio::test]
async fn burst_of_changes_is_never_lost() {
    init_tracing();
    let source = Arc::new(AtomicI64::new(0));
    let child = reading(&source);

    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(1));
    let parent = Node::new(Gated {
        calls: calls.clone(),
        gate: gate.clone(),
    });
    parent.add_child(&child);
    parent.init().await.unwrap();
    let (updates, _) = record_updates(&parent);

    source.store(1, Ordering::SeqCst);
    child.dirty().await.unwrap();
    wait_until(|| parent.is_updating()).await;

    for value in 2..=5 {
        source.store(value, Ordering::SeqCst);
        child.dirty().await.unwrap();
    }
    assert!(updates.lock().is_empty());

    gate.add_permits(8);
    wait_until(|| !updates.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*updates.lock(), vec![Value::from("b5")]);
    assert!(!parent.is_dirty());
    assert!(!parent.is_updating());
}

/// Counts setup hook runs and derivations.
struct Counted {
    setups: Arc<AtomicUsize>,
    derives: Arc<AtomicUsize>,
}

impl Compute for Counted {
    fn derive<'a>(&'a self, _inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        self.derives.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(Value::Null) })
    }

    fn on_init(&self, _node: &Node) -> Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// P2: repeated and concurrent `init` runs every setup hook once, even for a
/// child shared by two parents.
#[tokio::test]
async fn init_is_idempotent_across_a_diamond() {
    init_tracing();
    let setups = Arc::new(AtomicUsize::new(0));
    let derives = Arc::new(AtomicUsize::new(0));
    let shared = Node::new(Counted {
        setups: setups.clone(),
        derives: derives.clone(),
    });

    let top_setups = Arc::new(AtomicUsize::new(0));
    let top = Node::new(Counted {
        setups: top_setups.clone(),
        derives: Arc::new(AtomicUsize::new(0)),
    });
    for _ in 0..2 {
        let side = Node::empty();
        side.add_child(&shared);
        top.add_child(&side);
    }

    let (first, second) = tokio::join!(top.init(), top.init());
    first.unwrap();
    second.unwrap();
    top.init().await.unwrap();

    assert_eq!(setups.load(Ordering::SeqCst), 1);
    assert_eq!(derives.load(Ordering::SeqCst), 1);
    assert_eq!(top_setups.load(Ordering::SeqCst), 1);
    assert!(top.children().iter().all(Node::is_initialized));
}

/// P3: along a chain, no node settles while the node below it is dirty.
#[tokio::test]
async fn no_update_while_a_child_is_dirty() {
    init_tracing();
    let source = Arc::new(AtomicI64::new(0));
    let leaf = reading(&source);
    let middle = Node::from_fn(|inputs| Ok(Value::from(format!("m{}", inputs[0]))));
    middle.add_child(&leaf);
    let top = Node::from_fn(|inputs| Ok(Value::from(format!("t{}", inputs[0]))));
    top.add_child(&middle);
    top.init().await.unwrap();

    let (middle_updates, middle_premature) = record_updates(&middle);
    let (top_updates, top_premature) = record_updates(&top);

    for value in 1..=10 {
        source.store(value, Ordering::SeqCst);
        leaf.dirty().await.unwrap();
    }
    wait_until(|| top.cached() == Some(Value::from("tm10")) && !top.is_dirty()).await;

    assert_eq!(middle_premature.load(Ordering::SeqCst), 0);
    assert_eq!(top_premature.load(Ordering::SeqCst), 0);
    assert!(!middle_updates.lock().is_empty());
    assert_eq!(top_updates.lock().last(), Some(&Value::from("tm10")));
}

fn manual_registry() -> (ManualBackend, Arc<WatchShim>, ResourceRegistry) {
    let backend = ManualBackend::new();
    let shim = Arc::new(WatchShim::with_backend(Arc::new(backend.clone())));
    let registry = ResourceRegistry::new(shim.clone(), &CascadeConfig::default());
    (backend, shim, registry)
}

/// P4: N acquisitions share one watch, which stops on the Nth release.
#[tokio::test]
async fn registry_refcount_controls_the_watch() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.txt");
    std::fs::write(&path, "shared").unwrap();
    let (backend, shim, registry) = manual_registry();

    let nodes: Vec<Node> = (0..3)
        .map(|_| registry.acquire(&path, Encoding::Text).unwrap())
        .collect();
    for node in &nodes {
        node.init().await.unwrap();
    }
    assert_eq!(backend.started(), 1);
    assert_eq!(registry.ref_count(&path), 3);

    registry.release(&path);
    registry.release(&path);
    assert_eq!(backend.active(), 1);
    assert!(shim.is_watching(&path));

    registry.release(&path);
    assert_eq!(backend.started(), 1);
    assert_eq!(backend.stopped(), 1);
    assert!(!shim.is_watching(&path));
    assert!(nodes[0].is_disposed());
}

/// P5: a touch absorbs exactly one OS echo; the next change gets through.
#[tokio::test]
async fn touch_suppresses_one_echo_only() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("touched.txt");
    std::fs::write(&path, "x").unwrap();
    let backend = ManualBackend::new();
    let shim = WatchShim::with_backend(Arc::new(backend.clone()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    shim.watch(&path, WatchOptions::default(), move |change: &Change| {
        let _ = tx.send(change.synthetic);
    })
    .unwrap();

    shim.touch(&path).await.unwrap();
    assert_eq!(rx.recv().await, Some(true));

    backend.notify(&path);
    backend.notify(&path);
    let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(next, Some(false));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "the echo must not be delivered");
}

/// An outside edit reported by the backend flows up through a resource.
#[tokio::test]
async fn external_edit_reaches_decoded_value() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"port": 80}"#).unwrap();
    let (backend, _shim, registry) = manual_registry();

    let config = JsonNode::file(&registry, &path).unwrap();
    config.init().await.unwrap();
    assert_eq!(config.cached(), Some(Value::Json(json!({"port": 80}))));

    std::fs::write(&path, "{\"port\": 8080} // moved").unwrap();
    backend.notify(&path);

    wait_until(|| config.cached() == Some(Value::Json(json!({"port": 8080})))).await;
    assert!(!config.is_dirty());
}

/// Scenario C: force a rewrite of a real, polled file and see the decoded
/// value follow.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_rewrite_is_decoded() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");
    std::fs::write(&path, r#"{"a":1}"#).unwrap();

    let shim = Arc::new(WatchShim::new());
    let config = CascadeConfig::from_json_str(r#"{"poll_interval_ms": 20}"#).unwrap();
    let registry = ResourceRegistry::new(shim.clone(), &config);

    let decoded = JsonNode::file(&registry, &path).unwrap();
    decoded.init().await.unwrap();
    assert_eq!(decoded.cached(), Some(Value::Json(json!({"a": 1}))));

    tokio::time::timeout(
        Duration::from_secs(5),
        shim.write_and_wait(&path, r#"{"a":1,"b":2}"#),
    )
    .await
    .unwrap()
    .unwrap();

    let expected = Value::Json(json!({"a": 1, "b": 2}));
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if decoded.settled().await.as_ref() == Some(&expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    registry.release(&path);
    assert!(!shim.is_watching(&path));
}
