//! Watch-to-queue adapter
//!
//! Turns change notifications for the parent kind and every owned kind into
//! work queue keys. Parent events enqueue the parent itself; dependent events
//! are routed to their owner through the [`OwnershipIndex`]. Events that
//! cannot be attributed to a parent are dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client, Resource, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::controllers::ControllerRegistration;
use crate::crd::MyDeployment;
use crate::keys::{DependentRef, KindRef, ObjectKey};
use crate::metrics;
use crate::ownership::OwnershipIndex;
use crate::queue::WorkQueue;
use crate::store::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
        }
    }
}

/// A change to one object of a watched kind
#[derive(Clone, Debug)]
pub struct Notification {
    pub kind: KindRef,
    pub key: ObjectKey,
    pub event: EventType,
    pub owner_references: Vec<OwnerReference>,
}

impl Notification {
    pub fn from_object<K: Resource<DynamicType = ()>>(obj: &K, event: EventType) -> Self {
        Self {
            kind: KindRef::of::<K>(),
            key: ObjectKey::from_object(obj),
            event,
            owner_references: obj.owner_references().to_vec(),
        }
    }
}

pub struct EventSource {
    registration: ControllerRegistration,
    queue: Arc<WorkQueue<ObjectKey>>,
    index: Arc<OwnershipIndex>,
}

impl EventSource {
    pub fn new(
        registration: ControllerRegistration,
        queue: Arc<WorkQueue<ObjectKey>>,
        index: Arc<OwnershipIndex>,
    ) -> Self {
        Self {
            registration,
            queue,
            index,
        }
    }

    /// Route one notification. Returns the parent that was enqueued, if any.
    pub fn handle(&self, notification: &Notification) -> Option<ObjectKey> {
        metrics::WATCH_EVENTS
            .with_label_values(&[notification.kind.kind.as_str(), notification.event.as_str()])
            .inc();

        if notification.kind == self.registration.parent {
            self.queue.enqueue(notification.key.clone());
            return Some(notification.key.clone());
        }

        if !self.registration.owns(&notification.kind) {
            trace!(kind = %notification.kind, object = %notification.key, "Ignoring unregistered kind");
            return None;
        }

        let dependent = DependentRef::new(notification.kind.clone(), notification.key.clone());
        let owner = match notification.event {
            EventType::Added | EventType::Updated => {
                self.index.observe(dependent.clone(), &notification.owner_references)
            }
            EventType::Deleted => {
                let indexed = self.index.remove(&dependent);
                indexed.or_else(|| {
                    self.index
                        .owner_from(&dependent.key.namespace, &notification.owner_references)
                })
            }
        };

        match owner {
            Some(parent) => {
                debug!(dependent = %dependent, parent = %parent, event = notification.event.as_str(), "Dependent changed");
                self.queue.enqueue(parent.clone());
                Some(parent)
            }
            None => {
                trace!(dependent = %dependent, "No owning parent, dropping event");
                None
            }
        }
    }

    /// Feed notifications into the queue until the stream ends or shutdown
    pub async fn run<N>(&self, notifications: N, shutdown: CancellationToken)
    where
        N: Stream<Item = Notification> + Send,
    {
        futures::pin_mut!(notifications);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = notifications.next() => match next {
                    Some(notification) => {
                        self.handle(&notification);
                    }
                    None => {
                        warn!("Notification stream ended");
                        break;
                    }
                },
            }
        }
    }
}

/// Periodically enqueue every parent so missed events are eventually
/// recovered. The first pass runs after one full period.
pub async fn resync<S: Store>(
    store: Arc<S>,
    queue: Arc<WorkQueue<ObjectKey>>,
    namespace: Option<String>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match store.list_parents(namespace.as_deref()).await {
            Ok(parents) => {
                debug!(count = parents.len(), "Resync enqueueing parents");
                for parent in &parents {
                    queue.enqueue(ObjectKey::from_object(parent));
                }
            }
            Err(e) => warn!(error = %e, "Resync list failed"),
        }
    }
}

fn watch_kind<K>(api: Api<K>) -> impl Stream<Item = Notification> + Send
where
    K: Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::InitApply(obj)) => {
                    Some(Notification::from_object(&obj, EventType::Added))
                }
                Ok(watcher::Event::Apply(obj)) => {
                    Some(Notification::from_object(&obj, EventType::Updated))
                }
                Ok(watcher::Event::Delete(obj)) => {
                    Some(Notification::from_object(&obj, EventType::Deleted))
                }
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                Err(e) => {
                    warn!(kind = %K::kind(&()), error = %e, "Watch error");
                    None
                }
            }
        })
}

/// Merged watch stream over MyDeployments and the Deployments they own
pub fn kube_notifications(
    client: Client,
    namespace: Option<&str>,
) -> impl Stream<Item = Notification> + Send {
    let (parents, dependents): (Api<MyDeployment>, Api<Deployment>) = match namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    info!(namespace = namespace.unwrap_or("*"), "Watching MyDeployments and Deployments");
    futures::stream::select(watch_kind(parents), watch_kind(dependents))
}
