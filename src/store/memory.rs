//! In-memory store with API-server semantics
//!
//! Mirrors the parts of the API server the controller relies on:
//! resourceVersion compare-and-swap on every write, `generation` bumped only
//! by spec changes, a status sub-resource that spec writes cannot touch, an
//! immutable Deployment selector, owner-reference garbage collection and a
//! watch stream. Used by the tests and handy for local experiments.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use kube::{Resource, ResourceExt};
use tokio::sync::broadcast;
use tracing::debug;

use super::Store;
use crate::crd::{MyDeployment, MyDeploymentSpec};
use crate::error::{Error, Result};
use crate::events::{EventType, Notification};
use crate::keys::ObjectKey;

/// Change notification published by the in-memory store
#[derive(Clone, Debug)]
pub enum StoreEvent {
    Parent(EventType, MyDeployment),
    Dependent(EventType, Deployment),
}

impl StoreEvent {
    pub fn to_notification(&self) -> Notification {
        match self {
            StoreEvent::Parent(event, obj) => Notification::from_object(obj, *event),
            StoreEvent::Dependent(event, obj) => Notification::from_object(obj, *event),
        }
    }
}

/// Number of writes the controller performed, by kind of write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub dependent_creates: u32,
    pub dependent_updates: u32,
    pub status_updates: u32,
}

impl WriteCounts {
    pub fn total(&self) -> u32 {
        self.dependent_creates + self.dependent_updates + self.status_updates
    }
}

#[derive(Default)]
struct Inner {
    parents: HashMap<ObjectKey, MyDeployment>,
    dependents: HashMap<ObjectKey, Deployment>,
    resource_version: u64,
    uid: u64,
    writes: WriteCounts,
    dependent_update_log: Vec<Deployment>,
    dependent_conflicts: u32,
    status_conflicts: u32,
    get_failures: u32,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid += 1;
        format!("00000000-0000-0000-0000-{:012}", self.uid)
    }
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey> {
    if obj.meta().name.is_none() {
        return Err(Error::malformed("object has no name"));
    }
    if obj.meta().namespace.is_none() {
        return Err(Error::malformed(format!("{} has no namespace", obj.name_any())));
    }
    Ok(ObjectKey::from_object(obj))
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Subscribe to raw store events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Watch stream of every change made after the call, as notifications
    pub fn watch(&self) -> impl Stream<Item = Notification> + Send + 'static {
        futures::stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event.to_notification(), rx)),
                    // The periodic re-list covers anything we skipped
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Create a parent the way a user would: uid, version and generation 1
    pub fn create_parent(&self, parent: MyDeployment) -> Result<MyDeployment> {
        let key = key_of(&parent)?;
        let stored = {
            let mut inner = self.lock();
            if inner.parents.contains_key(&key) {
                return Err(Error::conflict(key.to_string()));
            }
            let mut parent = parent;
            parent.metadata.uid = Some(inner.next_uid());
            parent.metadata.resource_version = Some(inner.next_version());
            parent.metadata.generation = Some(1);
            inner.parents.insert(key, parent.clone());
            parent
        };
        self.publish(StoreEvent::Parent(EventType::Added, stored.clone()));
        Ok(stored)
    }

    /// Edit a parent's spec the way a user would. Bumps generation when the
    /// spec actually changes.
    pub fn edit_parent_spec<F>(&self, key: &ObjectKey, edit: F) -> Result<MyDeployment>
    where
        F: FnOnce(&mut MyDeploymentSpec),
    {
        let stored = {
            let mut inner = self.lock();
            let version = inner.next_version();
            let parent = inner
                .parents
                .get_mut(key)
                .ok_or_else(|| Error::not_found(key.to_string()))?;
            let before = parent.spec.clone();
            edit(&mut parent.spec);
            if parent.spec != before {
                parent.metadata.generation = Some(parent.metadata.generation.unwrap_or(0) + 1);
            }
            parent.metadata.resource_version = Some(version);
            parent.clone()
        };
        self.publish(StoreEvent::Parent(EventType::Updated, stored.clone()));
        Ok(stored)
    }

    /// Delete a parent and garbage-collect every dependent whose owner
    /// references carry the parent's uid.
    pub fn delete_parent(&self, key: &ObjectKey) -> Result<()> {
        let (parent, collected) = {
            let mut inner = self.lock();
            let parent = inner
                .parents
                .remove(key)
                .ok_or_else(|| Error::not_found(key.to_string()))?;
            let uid = parent.metadata.uid.clone().unwrap_or_default();
            let orphans: Vec<ObjectKey> = inner
                .dependents
                .iter()
                .filter(|(_, d)| d.owner_references().iter().any(|r| r.uid == uid))
                .map(|(k, _)| k.clone())
                .collect();
            let collected: Vec<Deployment> = orphans
                .iter()
                .filter_map(|k| inner.dependents.remove(k))
                .collect();
            (parent, collected)
        };
        debug!(parent = %key, collected = collected.len(), "Garbage collected dependents");
        self.publish(StoreEvent::Parent(EventType::Deleted, parent));
        for dependent in collected {
            self.publish(StoreEvent::Dependent(EventType::Deleted, dependent));
        }
        Ok(())
    }

    /// Delete a dependent directly, as an administrator might
    pub fn delete_dependent(&self, key: &ObjectKey) -> Result<()> {
        let removed = self
            .lock()
            .dependents
            .remove(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        self.publish(StoreEvent::Dependent(EventType::Deleted, removed));
        Ok(())
    }

    /// Overwrite a dependent's status, standing in for the workload controller
    pub fn set_dependent_status(&self, key: &ObjectKey, status: DeploymentStatus) -> Result<()> {
        let stored = {
            let mut inner = self.lock();
            let version = inner.next_version();
            let dependent = inner
                .dependents
                .get_mut(key)
                .ok_or_else(|| Error::not_found(key.to_string()))?;
            dependent.status = Some(status);
            dependent.metadata.resource_version = Some(version);
            dependent.clone()
        };
        self.publish(StoreEvent::Dependent(EventType::Updated, stored));
        Ok(())
    }

    /// Bump a dependent's resourceVersion without changing it, simulating a
    /// concurrent writer.
    pub fn touch_dependent(&self, key: &ObjectKey) -> Result<()> {
        let mut inner = self.lock();
        let version = inner.next_version();
        let dependent = inner
            .dependents
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        dependent.metadata.resource_version = Some(version);
        Ok(())
    }

    /// Edit a stored Deployment the way another writer would, such as the API
    /// server filling in defaults or a user patching the template.
    pub fn edit_dependent<F>(&self, key: &ObjectKey, edit: F) -> Result<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        let stored = {
            let mut inner = self.lock();
            let version = inner.next_version();
            let dependent = inner
                .dependents
                .get_mut(key)
                .ok_or_else(|| Error::not_found(key.to_string()))?;
            edit(dependent);
            dependent.metadata.resource_version = Some(version);
            dependent.clone()
        };
        self.publish(StoreEvent::Dependent(EventType::Updated, stored.clone()));
        Ok(stored)
    }

    /// Reject the next `n` dependent writes with a conflict
    pub fn inject_dependent_conflicts(&self, n: u32) {
        self.lock().dependent_conflicts = n;
    }

    /// Reject the next `n` status writes with a conflict
    pub fn inject_status_conflicts(&self, n: u32) {
        self.lock().status_conflicts = n;
    }

    /// Fail the next `n` parent reads with a timeout
    pub fn inject_get_failures(&self, n: u32) {
        self.lock().get_failures = n;
    }

    pub fn parent(&self, key: &ObjectKey) -> Option<MyDeployment> {
        self.lock().parents.get(key).cloned()
    }

    pub fn dependent(&self, key: &ObjectKey) -> Option<Deployment> {
        self.lock().dependents.get(key).cloned()
    }

    pub fn dependent_count(&self) -> usize {
        self.lock().dependents.len()
    }

    pub fn writes(&self) -> WriteCounts {
        self.lock().writes
    }

    /// Every payload accepted by `update_dependent`, oldest first
    pub fn dependent_updates(&self) -> Vec<Deployment> {
        self.lock().dependent_update_log.clone()
    }
}

fn check_version(stored: Option<&String>, sent: Option<&String>, what: &ObjectKey) -> Result<()> {
    match sent {
        Some(v) if Some(v) != stored => Err(Error::conflict(what.to_string())),
        _ => Ok(()),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<MyDeployment>> {
        let mut inner = self.lock();
        if inner.get_failures > 0 {
            inner.get_failures -= 1;
            return Err(Error::Timeout {
                operation: format!("get {}", key),
                timeout_ms: 0,
            });
        }
        Ok(inner.parents.get(key).cloned())
    }

    async fn list_parents(&self, namespace: Option<&str>) -> Result<Vec<MyDeployment>> {
        let inner = self.lock();
        let mut parents: Vec<MyDeployment> = inner
            .parents
            .iter()
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace == ns))
            .map(|(_, p)| p.clone())
            .collect();
        parents.sort_by_key(|p| ObjectKey::from_object(p));
        Ok(parents)
    }

    async fn update_parent_status(&self, parent: &MyDeployment) -> Result<MyDeployment> {
        let key = key_of(parent)?;
        let stored = {
            let mut inner = self.lock();
            if inner.status_conflicts > 0 {
                inner.status_conflicts -= 1;
                return Err(Error::conflict(key.to_string()));
            }
            let version = inner.next_version();
            let current = inner
                .parents
                .get_mut(&key)
                .ok_or_else(|| Error::not_found(key.to_string()))?;
            check_version(
                current.metadata.resource_version.as_ref(),
                parent.metadata.resource_version.as_ref(),
                &key,
            )?;
            current.status = parent.status.clone();
            current.metadata.resource_version = Some(version);
            let stored = current.clone();
            inner.writes.status_updates += 1;
            stored
        };
        self.publish(StoreEvent::Parent(EventType::Updated, stored.clone()));
        Ok(stored)
    }

    async fn get_dependent(&self, key: &ObjectKey) -> Result<Option<Deployment>> {
        Ok(self.lock().dependents.get(key).cloned())
    }

    async fn create_dependent(&self, deployment: &Deployment) -> Result<Deployment> {
        let key = key_of(deployment)?;
        let stored = {
            let mut inner = self.lock();
            if inner.dependents.contains_key(&key) {
                return Err(Error::conflict(key.to_string()));
            }
            let mut created = deployment.clone();
            created.metadata.uid = Some(inner.next_uid());
            created.metadata.resource_version = Some(inner.next_version());
            created.metadata.generation = Some(1);
            created.status = None;
            inner.dependents.insert(key, created.clone());
            inner.writes.dependent_creates += 1;
            created
        };
        self.publish(StoreEvent::Dependent(EventType::Added, stored.clone()));
        Ok(stored)
    }

    async fn update_dependent(&self, deployment: &Deployment) -> Result<Deployment> {
        let key = key_of(deployment)?;
        let stored = {
            let mut inner = self.lock();
            if inner.dependent_conflicts > 0 {
                inner.dependent_conflicts -= 1;
                return Err(Error::conflict(key.to_string()));
            }
            let version = inner.next_version();
            let current = inner
                .dependents
                .get_mut(&key)
                .ok_or_else(|| Error::not_found(key.to_string()))?;
            check_version(
                current.metadata.resource_version.as_ref(),
                deployment.metadata.resource_version.as_ref(),
                &key,
            )?;

            let old_selector = current.spec.as_ref().map(|s| s.selector.clone());
            let new_selector = deployment.spec.as_ref().map(|s| s.selector.clone());
            if old_selector != new_selector {
                return Err(Error::malformed(format!(
                    "{}: spec.selector is immutable",
                    key
                )));
            }

            if current.spec != deployment.spec {
                current.metadata.generation =
                    Some(current.metadata.generation.unwrap_or(0) + 1);
            }
            current.spec = deployment.spec.clone();
            current.metadata.labels = deployment.metadata.labels.clone();
            current.metadata.annotations = deployment.metadata.annotations.clone();
            current.metadata.owner_references = deployment.metadata.owner_references.clone();
            current.metadata.resource_version = Some(version);
            let stored = current.clone();
            inner.writes.dependent_updates += 1;
            inner.dependent_update_log.push(deployment.clone());
            stored
        };
        self.publish(StoreEvent::Dependent(EventType::Updated, stored.clone()));
        Ok(stored)
    }
}
