//! MyDeployment Kubernetes Operator
//!
//! This operator converges `MyDeployment` custom resources into Deployments.
//! Watch events feed a deduplicating work queue, a pool of workers runs the
//! reconciler, and owner references tie each Deployment to its parent.

pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod keys;
pub mod metrics;
pub mod ownership;
pub mod queue;
pub mod reconcilers;
pub mod store;

pub use error::{Error, Result};
