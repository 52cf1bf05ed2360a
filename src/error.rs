//! Error types for the MyDeployment Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object does not exist (or no longer exists) in the store
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Write rejected because the resourceVersion was stale
    #[error("Conflict writing {0}: object was modified concurrently")]
    Conflict(String),

    /// Store call exceeded its deadline
    #[error("Timed out after {timeout_ms}ms during {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The desired state cannot be turned into a valid Deployment
    #[error("Malformed spec: {0}")]
    Malformed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a malformed-spec error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Create a not-found error for the given object
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Create a conflict error for the given object
    pub fn conflict(what: impl Into<String>) -> Self {
        Error::Conflict(what.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Network, timeout and API-server failures that only need another attempt later
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Timeout { .. })
    }

    /// Short label used for the reconcile error metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Timeout { .. } => "timeout",
            Error::Malformed(_) => "malformed",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
        }
    }
}
