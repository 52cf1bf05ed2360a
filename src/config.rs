//! Operator configuration
//!
//! Every flag can also be set through a `MYDEPLOYMENT_*` environment variable.

use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::queue::ExponentialBackoff;

/// Command-line configuration of the operator binary
#[derive(Parser, Debug, Clone)]
#[command(name = "mydeployment-operator", version, about)]
pub struct OperatorConfig {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "MYDEPLOYMENT_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Seconds between full re-lists of MyDeployments
    #[arg(long, env = "MYDEPLOYMENT_RESYNC_SECS", default_value_t = 600)]
    pub resync_secs: u64,

    /// Deadline for a single API server call, in seconds
    #[arg(long, env = "MYDEPLOYMENT_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Conflict retries per reconcile before giving the key back to the queue
    #[arg(long, env = "MYDEPLOYMENT_MAX_CONFLICT_RETRIES", default_value_t = 5)]
    pub max_conflict_retries: u32,

    /// First retry delay after a failed reconcile, in milliseconds
    #[arg(long, env = "MYDEPLOYMENT_BACKOFF_BASE_MS", default_value_t = 5)]
    pub backoff_base_ms: u64,

    /// Upper bound of the retry delay, in seconds
    #[arg(long, env = "MYDEPLOYMENT_BACKOFF_MAX_SECS", default_value_t = 1000)]
    pub backoff_max_secs: u64,

    /// Port of the metrics and health endpoints
    #[arg(long, env = "MYDEPLOYMENT_METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "MYDEPLOYMENT_NAMESPACE")]
    pub namespace: Option<String>,
}

impl OperatorConfig {
    /// Runtime settings for the controller
    pub fn controller_config(&self) -> Result<ControllerConfig> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.resync_secs == 0 {
            return Err(Error::config("resync period must be positive"));
        }
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_max_secs),
        );
        if backoff.base > backoff.max {
            return Err(Error::config("backoff base exceeds backoff maximum"));
        }

        Ok(ControllerConfig {
            workers: self.workers,
            resync_period: Duration::from_secs(self.resync_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_conflict_retries: self.max_conflict_retries,
            backoff,
            namespace: self.namespace.clone(),
        })
    }
}

/// Runtime settings shared by the queue, the workers and the store
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub workers: usize,
    pub resync_period: Duration,
    pub request_timeout: Duration,
    pub max_conflict_retries: u32,
    pub backoff: ExponentialBackoff,
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_period: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
            max_conflict_retries: 5,
            backoff: ExponentialBackoff::default(),
            namespace: None,
        }
    }
}
