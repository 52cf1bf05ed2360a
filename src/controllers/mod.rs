//! Kubernetes controllers for the MyDeployment CRD
//!
//! This module contains the worker pool that drains the work queue and the
//! wiring that connects it to the API server.

mod my_deployment_controller;
mod runtime;

pub use my_deployment_controller::run as run_my_deployment_controller;
pub use runtime::Controller;

use k8s_openapi::api::apps::v1::Deployment;

use crate::crd::MyDeployment;
use crate::keys::KindRef;

/// Which parent kind a controller reconciles and which dependent kinds it
/// owns. The hosting runtime uses this to wire watches; owner references on
/// the dependents drive garbage collection.
#[derive(Clone, Debug)]
pub struct ControllerRegistration {
    pub parent: KindRef,
    pub owns: Vec<KindRef>,
}

impl ControllerRegistration {
    pub fn new(parent: KindRef) -> Self {
        Self {
            parent,
            owns: Vec::new(),
        }
    }

    /// Add an owned dependent kind
    pub fn owning(mut self, kind: KindRef) -> Self {
        if !self.owns.contains(&kind) {
            self.owns.push(kind);
        }
        self
    }

    pub fn owns(&self, kind: &KindRef) -> bool {
        self.owns.contains(kind)
    }

    /// MyDeployment parents owning Deployments
    pub fn for_my_deployment() -> Self {
        Self::new(KindRef::of::<MyDeployment>()).owning(KindRef::of::<Deployment>())
    }
}
