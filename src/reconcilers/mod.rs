//! Reconcilers for the MyDeployment CRD
//!
//! Reconcilers hold the business logic of a pass:
//! - Validating the spec
//! - Creating or updating the dependent Deployment
//! - Updating resource status

pub mod my_deployment;
