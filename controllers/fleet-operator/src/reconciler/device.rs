//! EdgeDevice label reconciliation
//!
//! The dual of the workload reconciler: given a device, find every workload
//! whose selector now matches it and align the device's `workload/*` labels
//! and status entries. Candidate workloads come from the `selector/*`
//! reverse index and are confirmed with the selector evaluator.
//!
//! A deleted device loses every binding before its connection finalizer is
//! released; the workload finalizer stays until the agent's next call.

use std::collections::BTreeSet;

use crds::labels::{DEVICE_CONNECTION_FINALIZER, bound_workloads};
use crds::selector::{device_lookup_keys, matches_device};
use crds::EdgeDevice;
use fleet_store::events::{actions, reasons};
use fleet_store::{EventType, object_ref};
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::error::ControllerError;
use crate::reconcile_helpers::{
    bind_device, has_finalizer, needs_binding, strip_bindings, unbind_device, without_finalizer,
};

impl Reconciler {
    /// Reconcile one EdgeDevice
    pub async fn reconcile_device(&self, device: &EdgeDevice) -> Result<Action, ControllerError> {
        let name = device.metadata.name.as_deref().unwrap_or_default();
        let namespace = device.metadata.namespace.as_deref().unwrap_or_default();

        if device.metadata.deletion_timestamp.is_some() {
            return self.finalize_device(device).await;
        }

        let labels = device.metadata.labels.clone().unwrap_or_default();
        let keys = device_lookup_keys(name, &labels);
        let candidates = self.store.list_workloads_by_index(namespace, &keys).await?;

        let mut desired = BTreeSet::new();
        for workload in &candidates {
            if workload.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let workload_name = workload.metadata.name.as_deref().unwrap_or_default();
            match matches_device(&workload.spec, name, &labels) {
                Ok(true) => {
                    desired.insert(workload_name.to_string());
                }
                Ok(false) => {}
                // Reported by the workload reconciler
                Err(e) => debug!("Skipping workload {}/{}: {}", namespace, workload_name, e),
            }
        }

        let mut current: BTreeSet<String> = bound_workloads(&labels).into_iter().collect();
        current.extend(device.status.iter().flat_map(|s| s.workloads.iter().map(|w| w.name.clone())));

        let mut latest = device.clone();
        let mut errors = Vec::new();

        for workload in &desired {
            if !needs_binding(&latest, workload) {
                continue;
            }
            match bind_device(self.store.as_ref(), &latest, workload).await {
                Ok(Some(updated)) => {
                    info!("Bound workload {} to device {}/{}", workload, namespace, name);
                    self.publish_binding(&updated, reasons::WORKLOAD_BOUND, workload).await;
                    latest = updated;
                }
                Ok(None) => return Ok(Action::await_change()),
                Err(e) => {
                    warn!("Failed to bind workload {} to device {}/{}: {}", workload, namespace, name, e);
                    errors.push(format!("{workload}: {e}"));
                }
            }
        }

        for workload in current.difference(&desired) {
            match unbind_device(self.store.as_ref(), &latest, workload).await {
                Ok(Some(updated)) => {
                    info!("Unbound workload {} from device {}/{}", workload, namespace, name);
                    self.publish_binding(&updated, reasons::WORKLOAD_UNBOUND, workload).await;
                    latest = updated;
                }
                Ok(None) => return Ok(Action::await_change()),
                Err(e) => {
                    warn!("Failed to unbind workload {} from device {}/{}: {}", workload, namespace, name, e);
                    errors.push(format!("{workload}: {e}"));
                }
            }
        }

        ControllerError::from_device_errors(errors)?;
        Ok(Action::await_change())
    }

    async fn publish_binding(&self, device: &EdgeDevice, reason: &str, workload: &str) {
        self.events
            .publish(
                &object_ref(device),
                EventType::Normal,
                reason,
                actions::RECONCILE,
                Some(format!("workload {workload}")),
            )
            .await;
    }

    /// Strip every binding, then release the connection finalizer
    async fn finalize_device(&self, device: &EdgeDevice) -> Result<Action, ControllerError> {
        let name = device.metadata.name.as_deref().unwrap_or_default();
        let namespace = device.metadata.namespace.as_deref().unwrap_or_default();

        if !has_finalizer(device, DEVICE_CONNECTION_FINALIZER) {
            return Ok(Action::await_change());
        }

        info!("Device {}/{} deleted, removing workload bindings", namespace, name);
        let Some(stripped) = strip_bindings(self.store.as_ref(), device).await? else {
            return Ok(Action::await_change());
        };

        self.store
            .patch_device_finalizers(&stripped, &without_finalizer(&stripped, DEVICE_CONNECTION_FINALIZER))
            .await?;
        info!("Released connection finalizer of device {}/{}", namespace, name);
        Ok(Action::await_change())
    }
}

#[cfg(test)]
#[path = "device_test.rs"]
mod device_test;
