//! EdgeAutoConfig reconciliation
//!
//! Every member of the auto-config's device set whose hardware labels match
//! `spec.properties` gets one workload per template, pinned to that device
//! and owned by the auto-config. Device progress is tracked in the status
//! and refreshed periodically, since it depends on device heartbeats the
//! controller does not watch.

use std::collections::BTreeMap;
use std::time::Duration;

use crds::labels::{HARDWARE_LABEL_PREFIX, MEMBER_OF_LABEL, sanitize_label_value};
use crds::{
    AutoConfigDevice, AutoConfigDeviceState, EdgeAutoConfig, EdgeAutoConfigStatus, EdgeDevice, EdgeWorkload,
    EdgeWorkloadSpec, WorkloadPhase,
};
use fleet_store::StoreError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Resource;
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::error::ControllerError;

/// Device progress is re-evaluated at this interval
pub const AUTO_CONFIG_RESYNC: Duration = Duration::from_secs(60);

/// Device selector for an auto-config: set membership plus hardware labels
pub fn member_selector(config: &EdgeAutoConfig) -> LabelSelector {
    let mut labels = BTreeMap::from([(MEMBER_OF_LABEL.to_string(), config.spec.device_set.clone())]);
    for (key, value) in &config.spec.properties {
        let key = if key.starts_with(HARDWARE_LABEL_PREFIX) {
            key.clone()
        } else {
            format!("{HARDWARE_LABEL_PREFIX}{key}")
        };
        labels.insert(key, sanitize_label_value(value));
    }
    LabelSelector {
        match_labels: Some(labels),
        ..Default::default()
    }
}

/// `Running` once the device reports every templated workload running
fn device_state(config: &EdgeAutoConfig, device: &EdgeDevice) -> AutoConfigDeviceState {
    let name = device.metadata.name.as_deref().unwrap_or_default();
    let entries = device.status.as_ref().map(|s| s.workloads.as_slice()).unwrap_or_default();
    let running = config.spec.workloads.iter().all(|template| {
        let workload = template.workload_name(name);
        entries
            .iter()
            .any(|e| e.name == workload && e.phase == WorkloadPhase::Running)
    });
    if running {
        AutoConfigDeviceState::Running
    } else {
        AutoConfigDeviceState::Pending
    }
}

impl Reconciler {
    /// Reconcile one EdgeAutoConfig
    pub async fn reconcile_auto_config(&self, config: &EdgeAutoConfig) -> Result<Action, ControllerError> {
        let name = config.metadata.name.as_deref().unwrap_or_default();
        let namespace = config.metadata.namespace.as_deref().unwrap_or_default();

        if config.metadata.deletion_timestamp.is_some() {
            // Owned workloads are garbage collected
            return Ok(Action::await_change());
        }

        if self.store.get_device_set(namespace, &config.spec.device_set).await?.is_none() {
            warn!(
                "Auto-config {}/{} references missing device set {}",
                namespace, name, config.spec.device_set
            );
            return Ok(Action::requeue(AUTO_CONFIG_RESYNC));
        }

        let devices = self.store.list_devices(namespace, &member_selector(config)).await?;
        let owner = config.controller_owner_ref(&());

        let mut tracked = Vec::with_capacity(devices.len());
        for device in devices.iter().filter(|d| d.metadata.deletion_timestamp.is_none()) {
            let device_name = device.metadata.name.as_deref().unwrap_or_default();
            for template in &config.spec.workloads {
                let workload_name = template.workload_name(device_name);
                if self.store.get_workload(namespace, &workload_name).await?.is_some() {
                    continue;
                }
                let workload = EdgeWorkload {
                    metadata: ObjectMeta {
                        name: Some(workload_name.clone()),
                        namespace: Some(namespace.to_string()),
                        owner_references: owner.clone().map(|o| vec![o]),
                        ..Default::default()
                    },
                    spec: EdgeWorkloadSpec {
                        device: Some(device_name.to_string()),
                        device_selector: None,
                        ..template.spec.clone()
                    },
                };
                match self.store.create_workload(&workload).await {
                    Ok(_) => info!(
                        "Created workload {}/{} for device {} from auto-config {}",
                        namespace, workload_name, device_name, name
                    ),
                    Err(StoreError::AlreadyExists(_)) => {
                        debug!("Workload {}/{} already exists", namespace, workload_name)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            tracked.push(AutoConfigDevice {
                name: device_name.to_string(),
                state: device_state(config, device),
            });
        }
        tracked.sort_by(|a, b| a.name.cmp(&b.name));

        let status = EdgeAutoConfigStatus { devices: tracked };
        if config.status.as_ref() != Some(&status) {
            debug!("Updating status of auto-config {}/{}", namespace, name);
            self.store.patch_auto_config_status(config, &status).await?;
        }

        Ok(Action::requeue(AUTO_CONFIG_RESYNC))
    }
}

#[cfg(test)]
#[path = "auto_config_test.rs"]
mod auto_config_test;
