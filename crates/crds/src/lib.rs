//! EdgeFleet CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the EdgeFleet operator and
//! edge gateway, plus the reserved label vocabulary and the selector
//! projection shared by both binding controllers.

pub mod edge_device;
pub mod signed_request;
pub mod edge_workload;
pub mod edge_device_set;
pub mod edge_device_group;
pub mod auto_config;
pub mod edge_config;
pub mod playbook;
pub mod references;
pub mod labels;
pub mod selector;

pub use edge_device::*;
pub use signed_request::*;
pub use edge_workload::*;
pub use edge_device_set::*;
pub use edge_device_group::*;
pub use auto_config::*;
pub use edge_config::*;
pub use playbook::*;
pub use references::*;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// API group shared by every EdgeFleet CRD
pub const API_GROUP: &str = "management.edgefleet.io";

/// API version shared by every EdgeFleet CRD
pub const API_VERSION: &str = "v1alpha1";

/// Definitions of every EdgeFleet CRD, in installation order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        EdgeDevice::crd(),
        EdgeDeviceSignedRequest::crd(),
        EdgeWorkload::crd(),
        EdgeDeviceSet::crd(),
        EdgeDeviceGroup::crd(),
        EdgeAutoConfig::crd(),
        EdgeConfig::crd(),
        Playbook::crd(),
        PlaybookExecution::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_crds_share_group() {
        let crds = all_crds();
        assert_eq!(crds.len(), 9);
        for crd in crds {
            assert_eq!(crd.spec.group, API_GROUP);
            assert_eq!(crd.spec.versions[0].name, API_VERSION);
        }
    }

    #[test]
    fn test_edge_device_crd_has_status_subresource() {
        let crd = EdgeDevice::crd();
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
        assert_eq!(crd.metadata.name.as_deref(), Some("edgedevices.management.edgefleet.io"));
    }
}
