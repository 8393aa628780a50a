//! End-to-end dispatch tests
//!
//! Drives a full operator (pre-start hooks, informer sync, starters, workers)
//! with Pod objects delivered through a channel informer, no cluster needed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use keel_common::{Error, Operation, ReconcileContext, Result, WorkItem};
use keel_operator::{
    ChannelInformer, Handler, Operator, OperatorConfig, ResourceKind, Starter,
};

fn pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Shared timeline of lifecycle events, in the order they happened
#[derive(Default)]
struct Timeline(Mutex<Vec<String>>);

impl Timeline {
    fn record(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

struct PodHandler {
    timeline: Arc<Timeline>,
    pre_start_failures: AtomicUsize,
    handled: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl PodHandler {
    fn new(timeline: Arc<Timeline>, pre_start_failures: usize) -> Arc<Self> {
        Arc::new(Self {
            timeline,
            pre_start_failures: AtomicUsize::new(pre_start_failures),
            handled: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Handler for PodHandler {
    fn name(&self) -> &str {
        "pods"
    }

    fn can_be_handled(&self, item: &WorkItem) -> bool {
        item.kind() == "pods"
    }

    async fn handle(&self, _ctx: &ReconcileContext, item: &WorkItem) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.handled.lock().insert(item.name().to_string());
        self.timeline.record(format!("handle {}", item.name()));
        Ok(())
    }

    async fn pre_start(&self, _ctx: &ReconcileContext) -> Result<()> {
        self.timeline.record("pre_start");
        let remaining = self.pre_start_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pre_start_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::temporary(None::<Error>, "CRD not installed yet"));
        }
        Ok(())
    }
}

struct RecordingStarter {
    timeline: Arc<Timeline>,
}

#[async_trait]
impl Starter for RecordingStarter {
    fn name(&self) -> &str {
        "gc"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        self.timeline.record("starter");
        shutdown.cancelled().await;
        Ok(())
    }
}

/// Handler that answers the first call for each object with a scripted
/// error, then succeeds
struct FirstCallFails {
    first: fn() -> Error,
    received: Mutex<Vec<String>>,
}

impl FirstCallFails {
    fn new(first: fn() -> Error) -> Arc<Self> {
        Arc::new(Self {
            first,
            received: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl Handler for FirstCallFails {
    fn name(&self) -> &str {
        "first-call-fails"
    }

    fn can_be_handled(&self, item: &WorkItem) -> bool {
        item.kind() == "pods"
    }

    async fn handle(&self, _ctx: &ReconcileContext, item: &WorkItem) -> Result<()> {
        let mut received = self.received.lock();
        let first_call = !received.iter().any(|name| name == item.name());
        received.push(item.name().to_string());
        if first_call {
            Err((self.first)())
        } else {
            Ok(())
        }
    }
}

fn update_key(name: &str) -> String {
    WorkItem::new(Operation::Update, "", "v1", "pods", "default", name)
        .unwrap()
        .key()
}

async fn run_synced(
    handler: Arc<dyn Handler>,
    pods: &[&str],
) -> (Arc<Operator>, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let (informer, events) = ChannelInformer::<Pod>::new("pods", ResourceKind::of::<Pod>());
    let operator = Arc::new(Operator::new(config()).unwrap());
    operator.register_handler(handler).unwrap();
    operator.register_informer(Arc::new(informer)).unwrap();
    for name in pods {
        events.add(pod(name));
    }
    events.mark_synced();

    let shutdown = CancellationToken::new();
    let run = {
        let operator = Arc::clone(&operator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { operator.start(shutdown).await })
    };
    (operator, shutdown, run)
}

fn config() -> OperatorConfig {
    OperatorConfig {
        worker_threads: 3,
        ..Default::default()
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Story: pods already present at startup are each reconciled once the
/// informer has synced, after pre-start hooks have succeeded
#[tokio::test(start_paused = true)]
async fn story_pods_reconciled_after_startup() {
    const PODS: usize = 5;

    let timeline = Arc::new(Timeline::default());
    let handler = PodHandler::new(Arc::clone(&timeline), 2);
    let (informer, events) = ChannelInformer::<Pod>::new("pods", ResourceKind::of::<Pod>());

    let operator = Arc::new(Operator::new(config()).unwrap());
    operator.register_handler(handler.clone()).unwrap();
    operator.register_informer(Arc::new(informer)).unwrap();
    operator
        .register_starter(Arc::new(RecordingStarter {
            timeline: Arc::clone(&timeline),
        }))
        .unwrap();

    for i in 0..PODS {
        events.add(pod(&format!("web-{i}")));
    }

    let shutdown = CancellationToken::new();
    let run = {
        let operator = Arc::clone(&operator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { operator.start(shutdown).await })
    };

    // Nothing is handled before the informer reports its initial sync
    wait_until(|| timeline.position("pre_start").is_some()).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    events.mark_synced();
    wait_until(|| handler.handled.lock().len() == PODS).await;

    // Each ADD was rewritten to a single UPDATE and handled once
    assert_eq!(handler.calls.load(Ordering::SeqCst), PODS);
    assert!(operator.queue().is_empty());

    // Pre-start failed twice and was retried; the starter ran after it
    let events_seen = timeline.events();
    let pre_starts = events_seen.iter().filter(|e| *e == "pre_start").count();
    assert_eq!(pre_starts, 3);
    let last_pre_start = events_seen.iter().rposition(|e| e == "pre_start").unwrap();
    assert!(timeline.position("starter").unwrap() > last_pre_start);

    shutdown.cancel();
    run.await.unwrap().unwrap();
    assert!(operator.queue().is_shutting_down());
}

/// Story: an update after startup reaches the handler; a resync with the
/// same resourceVersion does not
#[tokio::test(start_paused = true)]
async fn story_updates_after_startup() {
    let timeline = Arc::new(Timeline::default());
    let handler = PodHandler::new(Arc::clone(&timeline), 0);
    let (informer, events) = ChannelInformer::<Pod>::new("pods", ResourceKind::of::<Pod>());

    let operator = Arc::new(Operator::new(config()).unwrap());
    operator.register_handler(handler.clone()).unwrap();
    operator.register_informer(Arc::new(informer)).unwrap();
    events.mark_synced();

    let shutdown = CancellationToken::new();
    let run = {
        let operator = Arc::clone(&operator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { operator.start(shutdown).await })
    };

    let mut updated = pod("api");
    updated.metadata.resource_version = Some("2".to_string());
    events.update(pod("api"), pod("api"));
    events.update(pod("api"), updated);

    wait_until(|| handler.calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

/// Story: shutting down while waiting for a cache that never syncs is a
/// clean exit, and no handler runs
#[tokio::test(start_paused = true)]
async fn story_shutdown_before_sync() {
    let timeline = Arc::new(Timeline::default());
    let handler = PodHandler::new(Arc::clone(&timeline), 0);
    let (informer, events) = ChannelInformer::<Pod>::new("pods", ResourceKind::of::<Pod>());
    events.add(pod("web"));

    let operator = Arc::new(Operator::new(config()).unwrap());
    operator.register_handler(handler.clone()).unwrap();
    operator.register_informer(Arc::new(informer)).unwrap();

    let shutdown = CancellationToken::new();
    let run = {
        let operator = Arc::clone(&operator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { operator.start(shutdown).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();

    run.await.unwrap().unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
}

/// Story: a handler failure puts the item back through the rate limiter and
/// a worker hands it to the handler again, after which it is forgotten
#[tokio::test(start_paused = true)]
async fn story_failed_item_is_retried_until_it_succeeds() {
    let handler = FirstCallFails::new(|| Error::internal("backend unavailable"));
    let (operator, shutdown, run) = run_synced(handler.clone(), &["web"]).await;

    wait_until(|| handler.received().len() == 2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(handler.received(), ["web", "web"]);
    assert!(operator.queue().is_empty());
    assert_eq!(operator.queue().num_requeues(&update_key("web")), 0);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

/// Story: a reconcile-again signal is settled, not retried
#[tokio::test(start_paused = true)]
async fn story_reconcile_signal_is_not_requeued() {
    let handler = FirstCallFails::new(|| Error::reconcile("ready condition flipped"));
    let (operator, shutdown, run) = run_synced(handler.clone(), &["web"]).await;

    wait_until(|| handler.received().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(handler.received(), ["web"]);
    assert!(operator.queue().is_empty());
    assert_eq!(operator.queue().num_requeues(&update_key("web")), 0);

    shutdown.cancel();
    run.await.unwrap().unwrap();
}
