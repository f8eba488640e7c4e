//! Controller-specific error types.
//!
//! Errors from the fabric and the Kubernetes API are wrapped as-is; the
//! remaining variants cover startup, cancellation and the supporting servers.

use apic_client::ApicError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Epgconf Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// APIC API error
    #[error("APIC error: {0}")]
    Apic(#[from] ApicError),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cluster rejected a request (missing object, invalid patch)
    #[error("Cluster request failed: {0}")]
    Cluster(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Startup configuration could not be assembled
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    /// Remote command in a pod failed
    #[error("Pod exec failed: {0}")]
    Exec(String),

    /// Reconciliation was cancelled before it finished
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics or health probe server failed
    #[error("Server error: {0}")]
    Server(String),

    /// Leadership could not be acquired or was lost
    #[error("Leader election failed: {0}")]
    LeaderElection(String),
}

impl ControllerError {
    /// Whether this error is a real reconcile failure
    ///
    /// Cancellation at shutdown is not: it is neither counted in
    /// `epgconf_reconciliation_errors_total` nor logged at error level.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_not_a_failure() {
        assert!(!ControllerError::Cancelled.is_failure());
        assert!(ControllerError::Cluster("conflict".to_string()).is_failure());
        assert!(ControllerError::Apic(ApicError::NotFound("uni/tn-t".to_string())).is_failure());
    }
}
