//! Store backed by the Kubernetes API server

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{ListParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use tracing::debug;

use super::Store;
use crate::crd::MyDeployment;
use crate::error::{Error, Result};
use crate::keys::ObjectKey;

/// Field manager recorded on every write
const FIELD_MANAGER: &str = "mydeployment-operator";

pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    /// Run one API call under the configured deadline and translate the
    /// API server's status codes into store errors.
    async fn call<T, F>(&self, operation: &str, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = kube::Result<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err(Error::Timeout {
                operation: format!("{} {}", operation, what),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(kube::Error::Api(resp))) if resp.code == 409 => {
                debug!(operation, object = what, reason = %resp.reason, "Write conflict");
                Err(Error::conflict(what))
            }
            Ok(Err(kube::Error::Api(resp))) if resp.code == 404 => Err(Error::not_found(what)),
            Ok(Err(e)) => Err(Error::Kube(e)),
        }
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::malformed(format!("{} has no namespace", obj.name_any())))
}

#[async_trait]
impl Store for KubeStore {
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<MyDeployment>> {
        let api: Api<MyDeployment> = Api::namespaced(self.client.clone(), &key.namespace);
        self.call("get", &key.to_string(), api.get_opt(&key.name)).await
    }

    async fn list_parents(&self, namespace: Option<&str>) -> Result<Vec<MyDeployment>> {
        let api: Api<MyDeployment> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = self
            .call("list", "mydeployments", api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn update_parent_status(&self, parent: &MyDeployment) -> Result<MyDeployment> {
        let namespace = namespace_of(parent)?;
        let name = parent.name_any();
        let api: Api<MyDeployment> = Api::namespaced(self.client.clone(), &namespace);
        let body = serde_json::to_vec(parent)?;
        let what = format!("{}/{}", namespace, name);
        self.call(
            "replace_status",
            &what,
            api.replace_status(&name, &Self::post_params(), body),
        )
        .await
    }

    async fn get_dependent(&self, key: &ObjectKey) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        self.call("get", &key.to_string(), api.get_opt(&key.name)).await
    }

    async fn create_dependent(&self, deployment: &Deployment) -> Result<Deployment> {
        let namespace = namespace_of(deployment)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let what = format!("{}/{}", namespace, deployment.name_any());
        self.call("create", &what, api.create(&Self::post_params(), deployment))
            .await
    }

    async fn update_dependent(&self, deployment: &Deployment) -> Result<Deployment> {
        let namespace = namespace_of(deployment)?;
        let name = deployment.name_any();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let what = format!("{}/{}", namespace, name);
        self.call(
            "replace",
            &what,
            api.replace(&name, &Self::post_params(), deployment),
        )
        .await
    }
}
