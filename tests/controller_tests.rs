//! Integration tests for the controller: queue dedup, worker retry policy,
//! event routing and a full run against the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::Container;
use mydeployment_operator::config::ControllerConfig;
use mydeployment_operator::controllers::{Controller, ControllerRegistration};
use mydeployment_operator::crd::{MyDeployment, MyDeploymentSpec};
use mydeployment_operator::events::{EventType, Notification};
use mydeployment_operator::keys::{DependentRef, ObjectKey};
use mydeployment_operator::queue::ExponentialBackoff;
use mydeployment_operator::store::{InMemoryStore, Store};
use mydeployment_operator::Result;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Helpers
// ============================================================================

fn busybox() -> Container {
    Container {
        name: "main".to_string(),
        image: Some("busybox".to_string()),
        ..Default::default()
    }
}

fn my_deployment(name: &str, replicas: Option<i32>) -> MyDeployment {
    let mut parent = MyDeployment::new(
        name,
        MyDeploymentSpec {
            replicas,
            containers: vec![busybox()],
        },
    );
    parent.metadata.namespace = Some("default".to_string());
    parent
}

fn config(workers: usize) -> ControllerConfig {
    ControllerConfig {
        workers,
        resync_period: Duration::from_secs(3600),
        backoff: ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(100)),
        ..Default::default()
    }
}

fn controller(store: &Arc<InMemoryStore>, workers: usize) -> Controller<InMemoryStore> {
    Controller::new(
        store.clone(),
        ControllerRegistration::for_my_deployment(),
        config(workers),
    )
}

/// Poll `check` until it holds or five seconds pass
async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory store whose parent reads are slow and watched for overlap.
/// Two reads of the same key in flight at once mean two concurrent
/// reconciles of that key.
struct SlowStore {
    inner: InMemoryStore,
    delay: Duration,
    in_flight: Mutex<HashSet<ObjectKey>>,
    overlapped: AtomicBool,
    gets: AtomicUsize,
    panic_next: AtomicBool,
}

impl SlowStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            delay,
            in_flight: Mutex::new(HashSet::new()),
            overlapped: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
            panic_next: AtomicBool::new(false),
        }
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for SlowStore {
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<MyDeployment>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("parent read failed hard");
        }
        if !self.in_flight.lock().unwrap().insert(key.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        self.in_flight.lock().unwrap().remove(key);
        self.inner.get_parent(key).await
    }

    async fn list_parents(&self, namespace: Option<&str>) -> Result<Vec<MyDeployment>> {
        self.inner.list_parents(namespace).await
    }

    async fn update_parent_status(&self, parent: &MyDeployment) -> Result<MyDeployment> {
        self.inner.update_parent_status(parent).await
    }

    async fn get_dependent(&self, key: &ObjectKey) -> Result<Option<Deployment>> {
        self.inner.get_dependent(key).await
    }

    async fn create_dependent(&self, deployment: &Deployment) -> Result<Deployment> {
        self.inner.create_dependent(deployment).await
    }

    async fn update_dependent(&self, deployment: &Deployment) -> Result<Deployment> {
        self.inner.update_dependent(deployment).await
    }
}

fn container_count(d: &Deployment) -> usize {
    d.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map_or(0, |p| p.containers.len())
}

// ============================================================================
// Worker step
// ============================================================================

#[tokio::test]
async fn duplicate_events_reconcile_once() {
    let store = Arc::new(InMemoryStore::new());
    let parent = store.create_parent(my_deployment("web", None)).unwrap();
    let controller = controller(&store, 1);

    let notification = Notification::from_object(&parent, EventType::Updated);
    for _ in 0..10 {
        controller.event_source().handle(&notification);
    }
    assert_eq!(controller.queue().len(), 1);

    assert!(controller.process_next().await);
    assert!(controller.queue().is_empty());
    assert_eq!(store.writes().dependent_creates, 1);
    assert_eq!(store.writes().status_updates, 1);
}

#[tokio::test]
async fn failed_reconcile_is_retried_with_backoff_then_forgotten() {
    let store = Arc::new(InMemoryStore::new());
    let parent = store.create_parent(my_deployment("web", None)).unwrap();
    let key = ObjectKey::from_object(&parent);
    let controller = controller(&store, 1);

    store.inject_get_failures(2);
    controller.queue().enqueue(key.clone());

    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues(&key), 1);
    assert_eq!(controller.queue().delayed_len(), 1);
    assert!(store.dependent(&key).is_none());

    // Second attempt also fails and backs off further
    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues(&key), 2);

    // Third attempt succeeds and clears the backoff history
    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues(&key), 0);
    assert!(store.dependent(&key).is_some());
}

#[tokio::test]
async fn deleted_parent_is_forgotten_silently() {
    let store = Arc::new(InMemoryStore::new());
    let controller = controller(&store, 1);
    let key = ObjectKey::new("default", "ghost");

    controller.queue().enqueue(key.clone());
    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues(&key), 0);
    assert_eq!(controller.queue().delayed_len(), 0);
    assert_eq!(store.writes().total(), 0);
}

#[tokio::test]
async fn malformed_spec_stays_in_backoff() {
    let store = Arc::new(InMemoryStore::new());
    let mut parent = my_deployment("broken", None);
    parent.spec.containers.clear();
    let key = ObjectKey::from_object(&parent);
    store.create_parent(parent).unwrap();
    let controller = controller(&store, 1);

    controller.queue().enqueue(key.clone());
    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues(&key), 1);
    assert!(store.dependent(&key).is_none());
}

#[tokio::test]
async fn dependent_events_route_to_owner() {
    let store = Arc::new(InMemoryStore::new());
    let parent = store.create_parent(my_deployment("web", None)).unwrap();
    let key = ObjectKey::from_object(&parent);
    let controller = controller(&store, 1);

    controller.queue().enqueue(key.clone());
    assert!(controller.process_next().await);
    let deployment = store.dependent(&key).unwrap();

    let notification = Notification::from_object(&deployment, EventType::Updated);
    assert_eq!(controller.event_source().handle(&notification), Some(key.clone()));
    let dependent = DependentRef::new(notification.kind.clone(), key.clone());
    assert_eq!(controller.ownership().resolve(&dependent), Some(key));
}

#[tokio::test]
async fn process_next_returns_false_after_shutdown() {
    let store = Arc::new(InMemoryStore::new());
    let controller = controller(&store, 1);
    controller.queue().shut_down();
    assert!(!controller.process_next().await);
}

#[tokio::test]
async fn panicking_reconcile_releases_the_key() {
    let store = Arc::new(SlowStore::new(Duration::ZERO));
    let parent = store.inner.create_parent(my_deployment("web", None)).unwrap();
    let key = ObjectKey::from_object(&parent);
    let controller = Controller::new(
        store.clone(),
        ControllerRegistration::for_my_deployment(),
        config(1),
    );

    store.panic_next.store(true, Ordering::SeqCst);
    controller.queue().enqueue(key.clone());
    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues(&key), 1);
    assert_eq!(controller.queue().delayed_len(), 1);

    // The key is retried after its backoff instead of being stuck in processing
    assert!(controller.process_next().await);
    assert_eq!(controller.queue().num_requeues(&key), 0);
    assert!(store.inner.dependent(&key).is_some());
}

// ============================================================================
// Full controller run
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_converges_follows_edits_and_shuts_down() {
    let store = Arc::new(InMemoryStore::new());
    let shutdown = CancellationToken::new();
    let watch = store.watch();
    let run = tokio::spawn(controller(&store, 2).run(watch, shutdown.clone()));

    let key = ObjectKey::new("default", "web");
    store.create_parent(my_deployment("web", None)).unwrap();
    eventually("deployment creation", || store.dependent(&key).is_some()).await;
    eventually("status observedGeneration 1", || {
        store
            .parent(&key)
            .and_then(|p| p.status)
            .map_or(false, |s| s.observed_generation == 1)
    })
    .await;

    // Spec edit flows through the watch into an update
    store
        .edit_parent_spec(&key, |spec| {
            spec.containers.push(Container {
                name: "sidecar".to_string(),
                image: Some("nginx".to_string()),
                ..Default::default()
            })
        })
        .unwrap();
    eventually("template update", || {
        store.dependent(&key).map_or(false, |d| container_count(&d) == 2)
    })
    .await;

    // Dependent status changes reach the parent through the ownership index
    store
        .set_dependent_status(
            &key,
            DeploymentStatus {
                replicas: Some(1),
                ready_replicas: Some(1),
                available_replicas: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    eventually("ready replicas in status", || {
        store
            .parent(&key)
            .and_then(|p| p.status)
            .map_or(false, |s| s.ready_replicas == 1 && s.observed_generation == 2)
    })
    .await;

    // The controller settles: no further writes once converged
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = store.writes();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.writes(), settled);

    // Deleting the parent garbage-collects the Deployment
    store.delete_parent(&key).unwrap();
    eventually("cascade delete", || store.dependent(&key).is_none()).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("controller did not stop")
        .expect("controller task panicked");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_recovers_missed_events() {
    let store = Arc::new(InMemoryStore::new());
    let shutdown = CancellationToken::new();
    let config = ControllerConfig {
        resync_period: Duration::from_millis(50),
        ..config(1)
    };
    let controller = Controller::new(
        store.clone(),
        ControllerRegistration::for_my_deployment(),
        config,
    );
    // No watch events at all: only the periodic re-list can find the parent
    let run = tokio::spawn(controller.run(futures::stream::pending(), shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    store.create_parent(my_deployment("late", Some(2))).unwrap();
    let key = ObjectKey::new("default", "late");
    eventually("resync picks up parent", || store.dependent(&key).is_some()).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("controller did not stop")
        .expect("controller task panicked");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_reconcile_per_key_across_workers() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(100)));
    store.inner.create_parent(my_deployment("web", None)).unwrap();
    let key = ObjectKey::new("default", "web");
    let controller = Controller::new(
        store.clone(),
        ControllerRegistration::for_my_deployment(),
        config(4),
    );
    let queue = controller.queue().clone();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(controller.run(futures::stream::pending(), shutdown.clone()));

    // The start-up list schedules the first pass
    eventually("first pass in flight", || store.gets() == 1).await;
    for _ in 0..5 {
        queue.enqueue(key.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Re-enqueues during the pass collapse into exactly one follow-up pass
    eventually("follow-up pass", || store.gets() == 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.gets(), 2);
    assert!(!store.overlapped.load(Ordering::SeqCst));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("controller did not stop")
        .expect("controller task panicked");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_lets_in_flight_reconcile_finish() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
    store.inner.create_parent(my_deployment("web", None)).unwrap();
    let key = ObjectKey::new("default", "web");
    let controller = Controller::new(
        store.clone(),
        ControllerRegistration::for_my_deployment(),
        config(1),
    );
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(controller.run(futures::stream::pending(), shutdown.clone()));

    eventually("pass in flight", || store.gets() == 1).await;
    assert!(store.inner.dependent(&key).is_none());
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("controller did not stop")
        .expect("controller task panicked");
    assert!(store.inner.dependent(&key).is_some());
    let status = store.inner.parent(&key).and_then(|p| p.status).unwrap();
    assert_eq!(status.observed_generation, 1);
}
