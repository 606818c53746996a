//! FleetStore trait for mocking
//!
//! This trait abstracts the object store so the gateway and the controllers
//! can be unit tested against an in-memory implementation. `KubeStore`
//! implements it against the Kubernetes API; `MockFleetStore` keeps objects
//! in memory.
//!
//! Every patch takes the pre-image of the object it modifies and carries
//! its `resourceVersion`, so a concurrent writer surfaces as
//! [`StoreError::Conflict`] rather than a lost update.

use std::collections::BTreeMap;

use crds::selector::IndexKey;
use crds::{
    EdgeAutoConfig, EdgeAutoConfigStatus, EdgeDevice, EdgeDeviceSet, EdgeDeviceSignedRequest,
    EdgeDeviceSignedRequestStatus, EdgeDeviceStatus, EdgeWorkload, PlaybookExecution,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::StoreError;

/// Label changes for a merge patch; `None` removes the key
pub type LabelPatch = BTreeMap<String, Option<String>>;

/// Trait for object store operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// Getters return `Ok(None)` for absent objects; patches return
/// [`StoreError::NotFound`] instead.
#[async_trait::async_trait]
pub trait FleetStore: Send + Sync {
    // EdgeDevice
    async fn get_device(&self, namespace: &str, name: &str) -> Result<Option<EdgeDevice>, StoreError>;
    async fn create_device(&self, device: &EdgeDevice) -> Result<EdgeDevice, StoreError>;
    /// Devices whose labels satisfy `selector`
    async fn list_devices(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<EdgeDevice>, StoreError>;
    /// Devices carrying `workload/<workload>` (the `DeviceByWorkload` index)
    async fn list_devices_by_workload(&self, namespace: &str, workload: &str) -> Result<Vec<EdgeDevice>, StoreError>;
    async fn patch_device_status(&self, device: &EdgeDevice, status: &EdgeDeviceStatus) -> Result<EdgeDevice, StoreError>;
    async fn patch_device_labels(&self, device: &EdgeDevice, labels: &LabelPatch) -> Result<EdgeDevice, StoreError>;
    async fn patch_device_finalizers(&self, device: &EdgeDevice, finalizers: &[String]) -> Result<EdgeDevice, StoreError>;

    // EdgeWorkload
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<EdgeWorkload>, StoreError>;
    /// Workloads whose projection labels contribute any of `keys` (the `WorkloadByDevice` index)
    async fn list_workloads_by_index(&self, namespace: &str, keys: &[IndexKey]) -> Result<Vec<EdgeWorkload>, StoreError>;
    async fn create_workload(&self, workload: &EdgeWorkload) -> Result<EdgeWorkload, StoreError>;
    async fn patch_workload_labels(&self, workload: &EdgeWorkload, labels: &LabelPatch) -> Result<EdgeWorkload, StoreError>;
    async fn patch_workload_finalizers(&self, workload: &EdgeWorkload, finalizers: &[String]) -> Result<EdgeWorkload, StoreError>;

    // EdgeDeviceSignedRequest
    async fn get_signed_request(&self, namespace: &str, name: &str) -> Result<Option<EdgeDeviceSignedRequest>, StoreError>;
    async fn create_signed_request(&self, request: &EdgeDeviceSignedRequest) -> Result<EdgeDeviceSignedRequest, StoreError>;
    async fn patch_signed_request_status(&self, request: &EdgeDeviceSignedRequest, status: &EdgeDeviceSignedRequestStatus) -> Result<EdgeDeviceSignedRequest, StoreError>;

    // Sets, auto-configs, playbooks
    async fn get_device_set(&self, namespace: &str, name: &str) -> Result<Option<EdgeDeviceSet>, StoreError>;
    async fn patch_auto_config_status(&self, config: &EdgeAutoConfig, status: &EdgeAutoConfigStatus) -> Result<EdgeAutoConfig, StoreError>;
    /// Executions labeled `edgefleet/device=<device>`
    async fn list_playbook_executions(&self, namespace: &str, device: &str) -> Result<Vec<PlaybookExecution>, StoreError>;

    // Core objects
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;
    /// Secrets matching a `labelSelector` query string
    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StoreError>;
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError>;
}
