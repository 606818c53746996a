//! Controller-specific error types.
//!
//! Errors that can surface from reconcilers and from process startup. Library
//! errors are wrapped rather than re-described.

use crds::selector::SelectorError;
use edge_gateway::GatewayError;
use fleet_pki::PkiError;
use fleet_store::StoreError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the EdgeFleet operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Certificate authority error
    #[error("PKI error: {0}")]
    Pki(#[from] PkiError),

    /// Edge gateway error
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Workload selector cannot be evaluated
    #[error("Invalid selector: {0}")]
    Selector(#[from] SelectorError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Some per-device mutations failed; the others were applied
    #[error("{} device update(s) failed: {}", .0.len(), .0.join("; "))]
    Devices(Vec<String>),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics, probe or gateway server failure
    #[error("Server error: {0}")]
    Server(String),
}

impl ControllerError {
    /// Fold accumulated per-device failures into a result
    pub fn from_device_errors(errors: Vec<String>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Devices(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_are_joined() {
        assert!(ControllerError::from_device_errors(vec![]).is_ok());

        let err = ControllerError::from_device_errors(vec!["edge-01: conflict".into(), "edge-02: gone".into()])
            .unwrap_err();
        assert_eq!(err.to_string(), "2 device update(s) failed: edge-01: conflict; edge-02: gone");
    }
}
