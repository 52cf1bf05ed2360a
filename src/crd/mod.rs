//! Custom Resource Definitions for the MyDeployment Operator

mod my_deployment;

pub use my_deployment::*;

use kube::CustomResourceExt;

use crate::error::Result;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>> {
    let yaml = serde_yaml::to_string(&MyDeployment::crd())
        .map_err(|e| crate::Error::config(format!("failed to render CRD: {}", e)))?;
    Ok(vec![yaml])
}
