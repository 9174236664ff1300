#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use labeler_controller::{Controller, ControllerConfig, Outcome, Relationship};
use labeler_core::{Action, ChangeEvent, EventType, MemoryStore, ObjectKey, ReconcileError, Reconciler, Role};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Reconciler that records calls and fails transiently a scripted number of times.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, Instant)>>,
    transient_failures: Mutex<HashMap<String, u32>>,
    permanent: Mutex<HashSet<String>>,
    in_flight: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    work: Duration,
}

impl Recorder {
    fn with_work(work: Duration) -> Self { Self { work, ..Default::default() } }

    fn fail_transiently(&self, name: &str, times: u32) {
        self.transient_failures.lock().unwrap().insert(name.to_string(), times);
    }

    fn calls_for(&self, name: &str) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().filter(|(n, _)| n == name).map(|(_, t)| *t).collect()
    }
}

#[async_trait::async_trait]
impl Reconciler for Recorder {
    async fn reconcile(&self, obj: Arc<serde_json::Value>) -> Result<Action, ReconcileError> {
        let name = obj["metadata"]["name"].as_str().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push((name.clone(), Instant::now()));
        if !self.in_flight.lock().unwrap().insert(name.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.in_flight.lock().unwrap().remove(&name);

        if self.permanent.lock().unwrap().contains(&name) {
            return Err(ReconcileError::permanent("invalid customLabels"));
        }
        let mut failures = self.transient_failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&name) {
            if *left > 0 {
                *left -= 1;
                return Err(ReconcileError::transient("deployments not ready"));
            }
        }
        Ok(Action::done())
    }
}

fn labeler(name: &str) -> ObjectKey { ObjectKey::new("labeler", Some("default"), name) }

fn labeler_obj(name: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "clusterops.knative.dev/v1alpha1",
        "kind": "Labeler",
        "metadata": { "name": name, "namespace": "default", "generation": 1 },
        "spec": { "customLabels": { "team": "platform" } }
    })
}

fn primary_event(name: &str, ty: EventType) -> ChangeEvent {
    ChangeEvent::from_raw(Role::Primary, "Labeler", ty, &labeler_obj(name))
}

fn deployment_event(name: &str, owner: Option<&str>) -> ChangeEvent {
    let mut meta = serde_json::json!({ "name": name, "namespace": "default" });
    if let Some(owner) = owner {
        meta["ownerReferences"] = serde_json::json!([{ "kind": "Labeler", "name": owner, "controller": true }]);
    }
    ChangeEvent::from_raw(Role::Secondary, "Deployment", EventType::Updated, &serde_json::json!({ "metadata": meta }))
}

struct Harness {
    store: Arc<MemoryStore>,
    recorder: Arc<Recorder>,
    controller: Option<Controller>,
    primary_tx: mpsc::Sender<ChangeEvent>,
    secondary_tx: mpsc::Sender<ChangeEvent>,
    primary_rx: Option<mpsc::Receiver<ChangeEvent>>,
    secondary_rx: Option<mpsc::Receiver<ChangeEvent>>,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(config: ControllerConfig, recorder: Recorder) -> Self {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(recorder);
        let controller = Controller::new(config, store.clone(), recorder.clone()).unwrap();
        let (primary_tx, primary_rx) = controller.event_channel();
        let (secondary_tx, secondary_rx) = controller.event_channel();
        Self {
            store,
            recorder,
            controller: Some(controller),
            primary_tx,
            secondary_tx,
            primary_rx: Some(primary_rx),
            secondary_rx: Some(secondary_rx),
            shutdown: CancellationToken::new(),
        }
    }

    fn start(&mut self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        let controller = self.controller.take().unwrap();
        let primary = self.primary_rx.take().unwrap();
        let secondary = self.secondary_rx.take().unwrap();
        tokio::spawn(controller.run(primary, secondary, self.shutdown.clone()))
    }
}

fn config() -> ControllerConfig {
    ControllerConfig {
        workers: 3,
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(15),
        ..Default::default()
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn primary_add_reconciles_once() {
    let mut h = Harness::new(config(), Recorder::default());
    let counters = h.controller.as_ref().unwrap().counters();
    let queue = h.controller.as_ref().unwrap().queue();
    h.store.insert(labeler("foo"), labeler_obj("foo"));
    let run = h.start();

    h.primary_tx.send(primary_event("foo", EventType::Added)).await.unwrap();
    settle().await;

    assert_eq!(h.recorder.calls_for("foo").len(), 1);
    assert_eq!(counters.get("labeler", Outcome::Success), 1);
    assert!(queue.is_empty());
    assert_eq!(queue.processing_len(), 0);
    assert_eq!(queue.delayed_len(), 0);

    h.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn owned_deployment_change_reconciles_owner() {
    let mut h = Harness::new(config(), Recorder::default());
    h.store.insert(labeler("foo"), labeler_obj("foo"));
    let run = h.start();

    h.secondary_tx.send(deployment_event("web", Some("foo"))).await.unwrap();
    settle().await;

    assert_eq!(h.recorder.calls_for("foo").len(), 1);
    h.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn orphan_deployment_schedules_nothing() {
    let mut h = Harness::new(config(), Recorder::default());
    let counters = h.controller.as_ref().unwrap().counters();
    let run = h.start();

    h.secondary_tx.send(deployment_event("web", None)).await.unwrap();
    settle().await;

    assert!(h.recorder.calls.lock().unwrap().is_empty());
    assert_eq!(counters.total(), 0);
    h.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_within_cap() {
    let recorder = Recorder::default();
    recorder.fail_transiently("bar", 3);
    let mut h = Harness::new(config(), recorder);
    let counters = h.controller.as_ref().unwrap().counters();
    let queue = h.controller.as_ref().unwrap().queue();
    h.store.insert(labeler("bar"), labeler_obj("bar"));
    let run = h.start();

    h.primary_tx.send(primary_event("bar", EventType::Added)).await.unwrap();
    settle().await;

    let calls = h.recorder.calls_for("bar");
    assert_eq!(calls.len(), 4, "three failures then one success");
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps.windows(2).all(|g| g[0] < g[1]), "backoff not increasing: {gaps:?}");
    assert!(gaps.iter().all(|g| *g <= Duration::from_millis(15) + Duration::from_millis(1)), "{gaps:?}");
    assert_eq!(counters.get("labeler", Outcome::TransientError), 3);
    assert_eq!(counters.get("labeler", Outcome::Success), 1);
    // success forgets the backoff
    assert_eq!(queue.num_requeues(&labeler("bar")), 0);

    h.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let recorder = Recorder::default();
    recorder.permanent.lock().unwrap().insert("baz".into());
    let mut h = Harness::new(config(), recorder);
    let counters = h.controller.as_ref().unwrap().counters();
    let queue = h.controller.as_ref().unwrap().queue();
    h.store.insert(labeler("baz"), labeler_obj("baz"));
    let run = h.start();

    h.primary_tx.send(primary_event("baz", EventType::Updated)).await.unwrap();
    settle().await;

    assert_eq!(h.recorder.calls_for("baz").len(), 1);
    assert_eq!(counters.get("labeler", Outcome::PermanentError), 1);
    assert_eq!(queue.delayed_len(), 0);

    // a new trigger reconciles again
    h.primary_tx.send(primary_event("baz", EventType::Updated)).await.unwrap();
    settle().await;
    assert_eq!(h.recorder.calls_for("baz").len(), 2);

    h.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn deleted_object_is_noop() {
    let mut h = Harness::new(config(), Recorder::default());
    let counters = h.controller.as_ref().unwrap().counters();
    let run = h.start();

    h.primary_tx.send(primary_event("gone", EventType::Deleted)).await.unwrap();
    settle().await;

    assert!(h.recorder.calls.lock().unwrap().is_empty());
    assert_eq!(counters.get("labeler", Outcome::NotFound), 1);
    h.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn burst_on_one_key_never_overlaps() {
    let mut h = Harness::new(config(), Recorder::with_work(Duration::from_millis(3)));
    for name in ["foo", "bar"] {
        h.store.insert(labeler(name), labeler_obj(name));
    }
    let run = h.start();

    for i in 0..30 {
        let name = if i % 3 == 0 { "bar" } else { "foo" };
        h.primary_tx.send(primary_event(name, EventType::Updated)).await.unwrap();
        h.secondary_tx.send(deployment_event("web", Some("foo"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    settle().await;

    assert_eq!(h.recorder.overlaps.load(Ordering::SeqCst), 0);
    // coalescing keeps the number of reconciles well below the number of events
    let foo = h.recorder.calls_for("foo").len();
    assert!(foo >= 1 && foo < 50, "foo reconciled {foo} times");
    assert!(!h.recorder.calls_for("bar").is_empty());

    h.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_in_flight_reconcile_finish() {
    let mut h = Harness::new(config(), Recorder::with_work(Duration::from_millis(50)));
    h.store.insert(labeler("slow"), labeler_obj("slow"));
    let counters = h.controller.as_ref().unwrap().counters();
    let run = h.start();

    h.primary_tx.send(primary_event("slow", EventType::Added)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.recorder.calls_for("slow").len(), 1);

    h.shutdown.cancel();
    run.await.unwrap().unwrap();
    assert_eq!(counters.get("labeler", Outcome::Success), 1, "in-flight reconcile was cut short");
}

#[tokio::test(start_paused = true)]
async fn namespace_relationship_fans_out() {
    let cfg = ControllerConfig { relationship: Relationship::Namespace, ..config() };
    let mut h = Harness::new(cfg, Recorder::default());
    for name in ["a", "b"] {
        h.store.insert(labeler(name), labeler_obj(name));
    }
    let run = h.start();

    h.primary_tx.send(primary_event("a", EventType::Added)).await.unwrap();
    h.primary_tx.send(primary_event("b", EventType::Added)).await.unwrap();
    settle().await;
    h.secondary_tx.send(deployment_event("web", None)).await.unwrap();
    settle().await;

    assert_eq!(h.recorder.calls_for("a").len(), 2);
    assert_eq!(h.recorder.calls_for("b").len(), 2);
    h.shutdown.cancel();
    run.await.unwrap().unwrap();
}
