//! Worker pool driving the reconciler from the work queue

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, Stream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ControllerRegistration;
use crate::config::ControllerConfig;
use crate::events::{self, EventSource, Notification};
use crate::keys::ObjectKey;
use crate::metrics;
use crate::ownership::OwnershipIndex;
use crate::queue::WorkQueue;
use crate::reconcilers::my_deployment::{Outcome, Reconciler};
use crate::store::Store;

/// Metric label for the parent kind
const KIND: &str = "MyDeployment";

/// Shared state of one controller: the queue, the ownership index and the
/// reconciler every worker calls into.
pub struct Controller<S> {
    registration: ControllerRegistration,
    config: ControllerConfig,
    queue: Arc<WorkQueue<ObjectKey>>,
    index: Arc<OwnershipIndex>,
    events: Arc<EventSource>,
    reconciler: Reconciler<S>,
}

impl<S: Store> Controller<S> {
    pub fn new(store: Arc<S>, registration: ControllerRegistration, config: ControllerConfig) -> Self {
        let queue = Arc::new(WorkQueue::new(config.backoff.clone()));
        let index = Arc::new(OwnershipIndex::new(registration.parent.clone()));
        let events = Arc::new(EventSource::new(
            registration.clone(),
            queue.clone(),
            index.clone(),
        ));
        let reconciler = Reconciler::new(store, config.max_conflict_retries);
        Self {
            registration,
            config,
            queue,
            index,
            events,
            reconciler,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    pub fn ownership(&self) -> &Arc<OwnershipIndex> {
        &self.index
    }

    pub fn event_source(&self) -> &Arc<EventSource> {
        &self.events
    }

    pub fn registration(&self) -> &ControllerRegistration {
        &self.registration
    }

    /// Take one key from the queue and reconcile it. Returns `false` once the
    /// queue is shut down and drained.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        metrics::QUEUE_DEPTH.set(self.queue.len() as f64);
        metrics::ACTIVE_WORKERS.inc();
        metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

        let timer = metrics::RECONCILE_DURATION
            .with_label_values(&[KIND])
            .start_timer();
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await;
        timer.observe_duration();

        match result {
            Ok(Ok(Outcome::NotFound)) | Ok(Ok(Outcome::Terminating)) => {
                self.queue.forget(&key);
            }
            Ok(Ok(outcome)) => {
                self.queue.forget(&key);
                debug!(name = %key.name, namespace = %key.namespace, ?outcome, "Reconciled MyDeployment");
            }
            Ok(Err(e)) => {
                metrics::RECONCILIATION_ERRORS
                    .with_label_values(&[KIND, e.metric_label()])
                    .inc();
                metrics::QUEUE_RETRIES.inc();
                let delay = self.queue.enqueue_rate_limited(key.clone());
                let retries = self.queue.num_requeues(&key);
                if e.is_transient() || e.is_conflict() {
                    warn!(name = %key.name, namespace = %key.namespace, error = %e, retries, delay_ms = delay.as_millis() as u64, "Reconciliation failed, scheduling retry");
                } else {
                    error!(name = %key.name, namespace = %key.namespace, error = %e, retries, delay_ms = delay.as_millis() as u64, "Reconciliation failed, scheduling retry");
                }
            }
            Err(_) => {
                // The key still has to reach `done` below or it stays in processing forever
                metrics::RECONCILIATION_ERRORS
                    .with_label_values(&[KIND, "panic"])
                    .inc();
                metrics::QUEUE_RETRIES.inc();
                let delay = self.queue.enqueue_rate_limited(key.clone());
                error!(name = %key.name, namespace = %key.namespace, delay_ms = delay.as_millis() as u64, "Reconcile panicked, scheduling retry");
            }
        }

        self.queue.done(&key);
        metrics::ACTIVE_WORKERS.dec();
        true
    }

    /// Run the event adapter, the periodic re-list and the worker pool until
    /// `shutdown` fires. In-flight reconciles finish and ready keys are
    /// drained before this returns.
    pub async fn run<N>(self, notifications: N, shutdown: CancellationToken)
    where
        N: Stream<Item = Notification> + Send + 'static,
    {
        let controller = Arc::new(self);
        info!(
            parent = %controller.registration.parent,
            workers = controller.config.workers,
            "Starting controller"
        );

        // Level-triggered start: every existing parent gets one pass
        match controller
            .reconciler
            .store()
            .list_parents(controller.config.namespace.as_deref())
            .await
        {
            Ok(parents) => {
                for parent in &parents {
                    controller.queue.enqueue(ObjectKey::from_object(parent));
                }
            }
            Err(e) => warn!(error = %e, "Initial list failed, relying on watch events"),
        }

        let mut background = JoinSet::new();
        {
            let events = controller.events.clone();
            let token = shutdown.clone();
            background.spawn(async move { events.run(notifications, token).await });
        }
        background.spawn(events::resync(
            controller.reconciler.store().clone(),
            controller.queue.clone(),
            controller.config.namespace.clone(),
            controller.config.resync_period,
            shutdown.clone(),
        ));

        let mut workers = JoinSet::new();
        for id in 0..controller.config.workers {
            let controller = controller.clone();
            workers.spawn(async move {
                while controller.process_next().await {}
                debug!(worker = id, "Worker exiting");
            });
        }
        metrics::set_ready(true);

        shutdown.cancelled().await;
        info!("Shutdown requested, draining work queue");
        metrics::set_ready(false);
        controller.queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
        while let Some(joined) = background.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Background task failed");
            }
        }
        info!("Controller stopped");
    }
}
