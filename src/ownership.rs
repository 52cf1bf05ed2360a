//! Reverse index from dependent objects to the parent that owns them
//!
//! Entries are rebuilt from a dependent's owner references every time the
//! watch layer observes it. Only references to the controller's parent kind
//! count, and a dependent has at most one such owner.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::keys::{DependentRef, KindRef, ObjectKey};

pub struct OwnershipIndex {
    parent: KindRef,
    entries: RwLock<HashMap<DependentRef, ObjectKey>>,
}

impl OwnershipIndex {
    pub fn new(parent: KindRef) -> Self {
        Self {
            parent,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DependentRef, ObjectKey>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DependentRef, ObjectKey>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick the owning parent out of a dependent's owner references.
    /// A controller reference wins over a plain one.
    pub fn owner_from(&self, namespace: &str, refs: &[OwnerReference]) -> Option<ObjectKey> {
        let mut matching = refs
            .iter()
            .filter(|r| r.kind == self.parent.kind && r.api_version == self.parent.api_version);
        let first = matching.clone().next()?;
        let chosen = matching.find(|r| r.controller == Some(true)).unwrap_or(first);
        Some(ObjectKey::new(namespace, chosen.name.clone()))
    }

    /// Rebuild the entry for `dependent` from its current owner references and
    /// return the owner it now resolves to.
    pub fn observe(&self, dependent: DependentRef, refs: &[OwnerReference]) -> Option<ObjectKey> {
        let owner = self.owner_from(&dependent.key.namespace, refs);
        let mut entries = self.write();
        match &owner {
            Some(parent) => {
                entries.insert(dependent, parent.clone());
            }
            None => {
                entries.remove(&dependent);
            }
        }
        owner
    }

    pub fn resolve(&self, dependent: &DependentRef) -> Option<ObjectKey> {
        self.read().get(dependent).cloned()
    }

    /// Drop the entry for a deleted dependent, returning the owner it had
    pub fn remove(&self, dependent: &DependentRef) -> Option<ObjectKey> {
        self.write().remove(dependent)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
