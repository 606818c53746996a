//! EdgeWorkload binding reconciliation
//!
//! One pass over a workload:
//! 1. project its selector into `selector/*` labels; a changed projection is
//!    patched and the pass ends, the patch retriggers it
//! 2. make sure the workload finalizer is present
//! 3. bind every matching device not yet bound (forward minus reverse) and
//!    unbind every bound device that no longer matches (reverse minus forward)
//!
//! Device mutations are fanned out over `workload_concurrency` chunks; errors
//! are gathered once every chunk has finished.

use std::collections::BTreeSet;

use crds::labels::WORKLOAD_FINALIZER;
use crds::selector::{is_empty_selector, matches_device, project, projection_patch, validate};
use crds::{EdgeDevice, EdgeWorkload};
use fleet_store::events::{actions, reasons};
use fleet_store::{EventType, StoreError, object_ref};
use futures::future::join_all;
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::error::ControllerError;
use crate::reconcile_helpers::{
    bind_device, has_finalizer, needs_binding, split_chunks, unbind_device, with_finalizer, without_finalizer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Bind,
    Unbind,
}

fn device_name(device: &EdgeDevice) -> &str {
    device.metadata.name.as_deref().unwrap_or_default()
}

impl Reconciler {
    /// Reconcile one EdgeWorkload
    pub async fn reconcile_workload(&self, workload: &EdgeWorkload) -> Result<Action, ControllerError> {
        let name = workload.metadata.name.as_deref().unwrap_or_default();
        let namespace = workload.metadata.namespace.as_deref().unwrap_or_default();

        if workload.metadata.deletion_timestamp.is_some() {
            return self.finalize_workload(workload).await;
        }

        let labels = workload.metadata.labels.clone().unwrap_or_default();
        if let Some(patch) = projection_patch(&labels, &project(&workload.spec)) {
            info!("Updating selector projection of workload {}/{}", namespace, name);
            self.store.patch_workload_labels(workload, &patch).await?;
            return Ok(Action::await_change());
        }

        if !has_finalizer(workload, WORKLOAD_FINALIZER) {
            debug!("Adding finalizer to workload {}/{}", namespace, name);
            self.store
                .patch_workload_finalizers(workload, &with_finalizer(workload, WORKLOAD_FINALIZER))
                .await?;
        }

        let forward = match self.matching_devices(workload, namespace).await {
            Ok(devices) => devices,
            Err(ControllerError::Selector(e)) => {
                // A broken selector is a spec problem; the next spec edit retriggers us
                warn!("Workload {}/{} has an invalid selector: {}", namespace, name, e);
                self.events
                    .publish(
                        &object_ref(workload),
                        EventType::Warning,
                        reasons::CONFIGURATION_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };
        let reverse = self.store.list_devices_by_workload(namespace, name).await?;

        let forward_names: BTreeSet<&str> = forward.iter().map(device_name).collect();
        let to_remove: Vec<EdgeDevice> = reverse
            .into_iter()
            .filter(|d| !forward_names.contains(device_name(d)))
            .collect();
        let to_add: Vec<EdgeDevice> = forward.into_iter().filter(|d| needs_binding(d, name)).collect();

        debug!(
            "Workload {}/{}: {} device(s) to bind, {} to unbind",
            namespace,
            name,
            to_add.len(),
            to_remove.len()
        );

        let mut errors = self.fan_out(workload, to_add, Binding::Bind).await;
        errors.extend(self.fan_out(workload, to_remove, Binding::Unbind).await);
        ControllerError::from_device_errors(errors)?;

        Ok(Action::await_change())
    }

    /// Devices in `namespace` the workload's placement selects
    async fn matching_devices(
        &self,
        workload: &EdgeWorkload,
        namespace: &str,
    ) -> Result<Vec<EdgeDevice>, ControllerError> {
        let spec = &workload.spec;

        let candidates = if let Some(device) = spec.device.as_deref().filter(|d| !d.is_empty()) {
            self.store.get_device(namespace, device).await?.into_iter().collect()
        } else {
            match &spec.device_selector {
                Some(selector) if !is_empty_selector(selector) => {
                    // Surface selector errors before the store turns them into a query failure
                    validate(selector)?;
                    self.store.list_devices(namespace, selector).await?
                }
                _ => Vec::new(),
            }
        };

        let mut matched = Vec::with_capacity(candidates.len());
        for device in candidates {
            if device.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let labels = device.metadata.labels.clone().unwrap_or_default();
            if matches_device(spec, device_name(&device), &labels)? {
                matched.push(device);
            }
        }
        Ok(matched)
    }

    /// Apply `op` to every device, `workload_concurrency` chunks at a time
    ///
    /// Returns one message per failed device.
    async fn fan_out(&self, workload: &EdgeWorkload, devices: Vec<EdgeDevice>, op: Binding) -> Vec<String> {
        if devices.is_empty() {
            return Vec::new();
        }
        let name = workload.metadata.name.as_deref().unwrap_or_default();
        let chunks = split_chunks(devices, self.workload_concurrency);

        let workers = chunks.into_iter().map(|chunk| async move {
            let mut errors = Vec::new();
            for device in chunk {
                if let Err(e) = self.apply_binding(&device, name, op).await {
                    warn!("Failed to {:?} workload {} on device {}: {}", op, name, device_name(&device), e);
                    errors.push(format!("{}: {e}", device_name(&device)));
                }
            }
            errors
        });

        join_all(workers).await.into_iter().flatten().collect()
    }

    async fn apply_binding(&self, device: &EdgeDevice, workload: &str, op: Binding) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        let (result, reason) = match op {
            Binding::Bind => (bind_device(store, device, workload).await?, reasons::WORKLOAD_BOUND),
            Binding::Unbind => (unbind_device(store, device, workload).await?, reasons::WORKLOAD_UNBOUND),
        };
        if let Some(updated) = result {
            info!(
                "{} workload {} on device {}/{}",
                if op == Binding::Bind { "Bound" } else { "Unbound" },
                workload,
                updated.metadata.namespace.as_deref().unwrap_or_default(),
                device_name(&updated)
            );
            self.events
                .publish(
                    &object_ref(&updated),
                    EventType::Normal,
                    reason,
                    actions::RECONCILE,
                    Some(format!("workload {workload}")),
                )
                .await;
        }
        Ok(())
    }

    /// Tear down every binding, then release the workload finalizer
    async fn finalize_workload(&self, workload: &EdgeWorkload) -> Result<Action, ControllerError> {
        let name = workload.metadata.name.as_deref().unwrap_or_default();
        let namespace = workload.metadata.namespace.as_deref().unwrap_or_default();

        if !has_finalizer(workload, WORKLOAD_FINALIZER) {
            return Ok(Action::await_change());
        }

        let bound = self.store.list_devices_by_workload(namespace, name).await?;
        info!("Workload {}/{} deleted, unbinding {} device(s)", namespace, name, bound.len());
        let errors = self.fan_out(workload, bound, Binding::Unbind).await;
        ControllerError::from_device_errors(errors)?;

        self.store
            .patch_workload_finalizers(workload, &without_finalizer(workload, WORKLOAD_FINALIZER))
            .await?;
        info!("Released finalizer of workload {}/{}", namespace, name);
        Ok(Action::await_change())
    }
}

#[cfg(test)]
#[path = "workload_test.rs"]
mod workload_test;
