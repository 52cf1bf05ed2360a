//! MyDeployment Custom Resource Definition

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Container;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Replica count used when the spec leaves `replicas` unset
pub const DEFAULT_REPLICAS: i32 = 1;

/// MyDeployment resource specification
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.demo.cnoe.io",
    version = "v1",
    kind = "MyDeployment",
    plural = "mydeployments",
    singular = "mydeployment",
    shortname = "mydep",
    namespaced,
    status = "MyDeploymentStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".status.replicas"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.readyReplicas"}"#,
    printcolumn = r#"{"name": "Available", "type": "integer", "jsonPath": ".status.availableReplicas"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MyDeploymentSpec {
    /// Number of desired pods. Unset means "not specified" and defaults to 1;
    /// an explicit zero scales the Deployment down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Containers of the pod template, in order. There must be at least one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
}

/// MyDeployment status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MyDeploymentStatus {
    /// Generation of the spec the controller last converged
    #[serde(default)]
    pub observed_generation: i64,

    /// Non-terminated pods targeted by the Deployment
    #[serde(default)]
    pub replicas: i32,

    /// Pods with a Ready condition
    #[serde(default)]
    pub ready_replicas: i32,

    /// Pods available for at least minReadySeconds
    #[serde(default)]
    pub available_replicas: i32,

    /// Pods still required for 100% available capacity
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MyDeploymentStatus {
    /// Find a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace a condition, keeping the transition time when the
    /// status value did not flip.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }
}

/// Status condition
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn ready(status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Utc::now(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}
