//! MyDeployment controller
//!
//! Watches MyDeployment resources and the Deployments they own and runs the
//! reconcile loop against the API server.

use std::sync::Arc;

use kube::{api::ListParams, Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{Controller, ControllerRegistration};
use crate::config::ControllerConfig;
use crate::crd::MyDeployment;
use crate::events;
use crate::store::KubeStore;

/// Run the MyDeployment controller until `shutdown` fires
pub async fn run(client: Client, config: ControllerConfig, shutdown: CancellationToken) {
    let api: Api<MyDeployment> = match config.namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("MyDeployment CRD not installed: {}", e);
        return;
    }

    info!("Starting MyDeployment controller");

    let store = Arc::new(KubeStore::new(client.clone(), config.request_timeout));
    let notifications = events::kube_notifications(client, config.namespace.as_deref());
    Controller::new(store, ControllerRegistration::for_my_deployment(), config)
        .run(notifications, shutdown)
        .await;
}
