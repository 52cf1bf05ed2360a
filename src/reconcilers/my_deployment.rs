//! MyDeployment reconciler
//!
//! Converges the Deployment that backs a MyDeployment:
//! - Spec validation
//! - Desired Deployment shape (pure, deterministic)
//! - Create-or-update with selector immutability and conflict retry
//! - Status updates

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::crd::{Condition, MyDeployment, MyDeploymentStatus, DEFAULT_REPLICAS};
use crate::error::{Error, Result};
use crate::keys::ObjectKey;
use crate::metrics;
use crate::store::Store;

/// Label binding a Deployment's pods to the MyDeployment that owns them
pub const SELECTOR_KEY: &str = "myDeploymentName";

/// Annotation recording the pod template last written to the Deployment
pub const TEMPLATE_ANNOTATION: &str = "apps.demo.cnoe.io/last-applied-template";

/// Pause between conflict retries
const CONFLICT_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// What happened to the dependent Deployment during a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependentAction {
    Created,
    Updated,
    Unchanged,
}

impl DependentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependentAction::Created => "created",
            DependentAction::Updated => "updated",
            DependentAction::Unchanged => "unchanged",
        }
    }
}

/// Result of one reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The parent no longer exists; nothing to do
    NotFound,
    /// The parent is being deleted; garbage collection owns the dependent now
    Terminating,
    Converged {
        dependent: DependentAction,
        status_written: bool,
    },
}

/// Validate the MyDeployment spec
pub fn validate(parent: &MyDeployment) -> Result<()> {
    if parent.spec.containers.is_empty() {
        return Err(Error::malformed("At least one container must be specified"));
    }

    for (i, container) in parent.spec.containers.iter().enumerate() {
        if container.image.as_deref().map_or(true, str::is_empty) {
            return Err(Error::malformed(format!("Container {} has no image", i)));
        }
    }

    if let Some(replicas) = parent.spec.replicas {
        if replicas < 0 {
            return Err(Error::malformed(format!(
                "Invalid replicas {}: must not be negative",
                replicas
            )));
        }
    }

    Ok(())
}

/// Selector (and pod template) labels for the Deployment of `name`
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(SELECTOR_KEY.to_string(), name.to_string())])
}

pub fn desired_replicas(parent: &MyDeployment) -> i32 {
    parent.spec.replicas.unwrap_or(DEFAULT_REPLICAS)
}

/// Pod template derived from the parent's container set
pub fn desired_template(parent: &MyDeployment) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(selector_labels(&parent.name_any())),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: parent.spec.containers.clone(),
            ..Default::default()
        }),
    }
}

/// Deployment to submit when none exists yet. This is the only place the
/// selector and the owner reference are set.
pub fn new_dependent(parent: &MyDeployment) -> Result<Deployment> {
    let name = parent.name_any();
    let namespace = parent
        .namespace()
        .ok_or_else(|| Error::malformed(format!("{} has no namespace", name)))?;
    let mut owner = parent
        .controller_owner_ref(&())
        .ok_or_else(|| Error::malformed(format!("{} has no uid", name)))?;
    owner.block_owner_deletion = Some(true);
    let template = desired_template(parent);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace),
            owner_references: Some(vec![owner]),
            annotations: Some(BTreeMap::from([(
                TEMPLATE_ANNOTATION.to_string(),
                template_fingerprint(&template),
            )])),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(desired_replicas(parent)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&name)),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        status: None,
    })
}

/// Overwrite the mutable fields (replicas and pod template) of an existing
/// Deployment. Selector and owner references are left alone. Returns
/// whether anything changed.
///
/// The template counts as converged when the recorded template matches the
/// desired one and every field the controller sets still holds its value on
/// the live object. Fields the API server defaults are not compared.
pub fn apply_mutable_fields(parent: &MyDeployment, deployment: &mut Deployment) -> bool {
    let replicas = Some(desired_replicas(parent));
    let template = desired_template(parent);
    let fingerprint = template_fingerprint(&template);
    let recorded = deployment.annotations().get(TEMPLATE_ANNOTATION) == Some(&fingerprint);

    let mut changed = false;
    let spec = deployment.spec.get_or_insert_with(DeploymentSpec::default);
    if spec.replicas != replicas {
        spec.replicas = replicas;
        changed = true;
    }
    if !recorded || !template_covered(&template, &spec.template) {
        spec.template = template;
        deployment
            .annotations_mut()
            .insert(TEMPLATE_ANNOTATION.to_string(), fingerprint);
        changed = true;
    }
    changed
}

fn template_fingerprint(template: &PodTemplateSpec) -> String {
    serde_json::to_string(template).unwrap_or_default()
}

/// Whether every field set in `desired` has the same value in `live`
fn template_covered(desired: &PodTemplateSpec, live: &PodTemplateSpec) -> bool {
    match (serde_json::to_value(desired), serde_json::to_value(live)) {
        (Ok(desired), Ok(live)) => covers(&desired, &live),
        _ => false,
    }
}

/// Objects match on the desired keys only; lists must have the same length.
fn covers(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(desired), Value::Object(live)) => desired.iter().all(|(key, value)| {
            live.get(key)
                .map_or(value.is_null(), |live_value| covers(value, live_value))
        }),
        (Value::Array(desired), Value::Array(live)) => {
            desired.len() == live.len() && desired.iter().zip(live).all(|(d, l)| covers(d, l))
        }
        _ => desired == live,
    }
}

/// Status summarising `dependent` for a pass that read the parent at
/// `generation`. observedGeneration never moves backwards.
pub fn compute_status(
    generation: i64,
    dependent: &Deployment,
    previous: Option<&MyDeploymentStatus>,
) -> MyDeploymentStatus {
    let observed = dependent.status.clone().unwrap_or_default();
    let mut status = previous.cloned().unwrap_or_default();

    status.observed_generation = status.observed_generation.max(generation);
    status.replicas = observed.replicas.unwrap_or(0);
    status.ready_replicas = observed.ready_replicas.unwrap_or(0);
    status.available_replicas = observed.available_replicas.unwrap_or(0);
    status.unavailable_replicas = observed.unavailable_replicas.unwrap_or(0);
    status.set_condition(Condition::ready(
        true,
        "Reconciled",
        format!("Deployment {} is up to date", dependent.name_any()),
    ));
    status
}

enum StatusWrite {
    Written,
    Unchanged,
    ParentGone,
}

pub struct Reconciler<S> {
    store: Arc<S>,
    max_conflict_retries: u32,
}

impl<S: Store> Reconciler<S> {
    pub fn new(store: Arc<S>, max_conflict_retries: u32) -> Self {
        Self {
            store,
            max_conflict_retries,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Drive the Deployment of `key` toward the parent's desired state and
    /// publish the observed state in the parent's status.
    #[instrument(skip(self), fields(name = %key.name, namespace = %key.namespace))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let Some(parent) = self.store.get_parent(key).await? else {
            debug!("MyDeployment no longer exists");
            return Ok(Outcome::NotFound);
        };

        if parent.metadata.deletion_timestamp.is_some() {
            debug!("MyDeployment is being deleted, skipping");
            return Ok(Outcome::Terminating);
        }

        let generation = parent.metadata.generation.unwrap_or(0);

        if let Err(e) = validate(&parent) {
            warn!(error = %e, "Validation failed");
            self.report_malformed(&parent, &e).await;
            return Err(e);
        }

        let (dependent_action, dependent) = self.create_or_update(&parent).await?;
        if dependent_action != DependentAction::Unchanged {
            metrics::DEPENDENT_WRITES
                .with_label_values(&[dependent_action.as_str()])
                .inc();
            info!(
                deployment = %dependent.name_any(),
                action = dependent_action.as_str(),
                generation,
                "Converged Deployment"
            );
        }

        let status_written = match self.write_status(parent, generation, &dependent).await? {
            StatusWrite::Written => true,
            StatusWrite::Unchanged => false,
            StatusWrite::ParentGone => return Ok(Outcome::NotFound),
        };

        Ok(Outcome::Converged {
            dependent: dependent_action,
            status_written,
        })
    }

    /// Create-or-update, re-running the whole fetch/branch/write step when
    /// the write lost a race with another writer.
    async fn create_or_update(&self, parent: &MyDeployment) -> Result<(DependentAction, Deployment)> {
        let mut attempt = 0;
        loop {
            match self.converge_dependent(parent).await {
                Err(e) if (e.is_conflict() || e.is_not_found()) && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    metrics::CONFLICT_RETRIES.with_label_values(&["dependent"]).inc();
                    debug!(attempt, error = %e, "Deployment write raced, retrying");
                    tokio::time::sleep(CONFLICT_RETRY_PAUSE).await;
                }
                other => return other,
            }
        }
    }

    async fn converge_dependent(&self, parent: &MyDeployment) -> Result<(DependentAction, Deployment)> {
        let key = ObjectKey::from_object(parent);

        match self.store.get_dependent(&key).await? {
            None => {
                let desired = new_dependent(parent)?;
                let created = self.store.create_dependent(&desired).await?;
                Ok((DependentAction::Created, created))
            }
            Some(existing) => {
                let mut updated = existing.clone();
                if !apply_mutable_fields(parent, &mut updated) {
                    return Ok((DependentAction::Unchanged, existing));
                }
                let updated = self.store.update_dependent(&updated).await?;
                Ok((DependentAction::Updated, updated))
            }
        }
    }

    /// Write the status computed from `dependent`, skipping the write when
    /// nothing changed. Conflicts re-read the parent and try again.
    async fn write_status(
        &self,
        mut parent: MyDeployment,
        generation: i64,
        dependent: &Deployment,
    ) -> Result<StatusWrite> {
        let key = ObjectKey::from_object(&parent);
        let mut attempt = 0;
        loop {
            let desired = compute_status(generation, dependent, parent.status.as_ref());
            if parent.status.as_ref() == Some(&desired) {
                return Ok(StatusWrite::Unchanged);
            }
            parent.status = Some(desired);

            match self.store.update_parent_status(&parent).await {
                Ok(_) => {
                    metrics::STATUS_WRITES.inc();
                    return Ok(StatusWrite::Written);
                }
                Err(e) if e.is_not_found() => return Ok(StatusWrite::ParentGone),
                Err(e) if e.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    metrics::CONFLICT_RETRIES.with_label_values(&["status"]).inc();
                    debug!(attempt, "Status write raced, re-reading MyDeployment");
                    tokio::time::sleep(CONFLICT_RETRY_PAUSE).await;
                    match self.store.get_parent(&key).await? {
                        Some(fresh) => parent = fresh,
                        None => return Ok(StatusWrite::ParentGone),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record a Ready=False condition for a spec that cannot be converged.
    /// observedGeneration is left behind so the lag stays visible.
    async fn report_malformed(&self, parent: &MyDeployment, error: &Error) {
        let mut status = parent.status.clone().unwrap_or_default();
        status.set_condition(Condition::ready(false, "InvalidSpec", error.to_string()));
        if parent.status.as_ref() == Some(&status) {
            return;
        }

        let mut updated = parent.clone();
        updated.status = Some(status);
        match self.store.update_parent_status(&updated).await {
            Ok(_) => metrics::STATUS_WRITES.inc(),
            Err(e) => warn!(error = %e, "Failed to record invalid spec in status"),
        }
    }
}
