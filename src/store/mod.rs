//! Object store access
//!
//! The reconciler talks to the store only through [`Store`]. Every write
//! carries the object's resourceVersion; a stale version is reported as
//! [`Error::Conflict`](crate::Error::Conflict) rather than silently
//! overwriting someone else's change.

mod api_server;
mod memory;

pub use api_server::KubeStore;
pub use memory::{InMemoryStore, StoreEvent, WriteCounts};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;

use crate::crd::MyDeployment;
use crate::error::Result;
use crate::keys::ObjectKey;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch a parent; `None` if it does not exist
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<MyDeployment>>;

    /// List parents in `namespace`, or in every namespace
    async fn list_parents(&self, namespace: Option<&str>) -> Result<Vec<MyDeployment>>;

    /// Replace only the status sub-resource of a parent
    async fn update_parent_status(&self, parent: &MyDeployment) -> Result<MyDeployment>;

    /// Fetch a dependent Deployment; `None` if it does not exist
    async fn get_dependent(&self, key: &ObjectKey) -> Result<Option<Deployment>>;

    async fn create_dependent(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn update_dependent(&self, deployment: &Deployment) -> Result<Deployment>;
}
