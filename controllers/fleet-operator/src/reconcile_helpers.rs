//! Helper functions shared by the binding reconcilers
//!
//! Every device mutation is a status subresource patch followed by a
//! metadata patch. Each one is retried on its own: a conflict re-reads the
//! device and recomputes the change against the fresh copy.

use std::collections::BTreeMap;

use crds::labels::{LABEL_TRUE, WORKLOAD_LABEL_PREFIX, workload_label};
use crds::{EdgeDevice, EdgeDeviceStatus, WorkloadStatusEntry};
use fleet_store::{FleetStore, LabelPatch, StoreError};
use kube::Resource;
use tracing::debug;

/// Attempts per patch before a conflict is surfaced
pub const CONFLICT_ATTEMPTS: usize = 4;

/// `namespace/name` of any object
pub fn resource_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default()
    )
}

/// Returns true if `obj` carries `finalizer`
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta().finalizers.iter().flatten().any(|f| f == finalizer)
}

/// Finalizers of `obj` with `finalizer` appended
pub fn with_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Vec<String> {
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// Finalizers of `obj` without `finalizer`
pub fn without_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Vec<String> {
    obj.meta()
        .finalizers
        .iter()
        .flatten()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect()
}

/// Split `items` into at most `k` chunks of as-equal-as-possible size
///
/// Base size is `n / k`; the first `n % k` chunks take one extra element.
/// Empty chunks are not produced.
pub fn split_chunks<T>(items: Vec<T>, k: usize) -> Vec<Vec<T>> {
    let k = k.max(1);
    let n = items.len();
    let base = n / k;
    let extra = n % k;

    let mut chunks = Vec::with_capacity(k.min(n));
    let mut rest = items.into_iter();
    for i in 0..k {
        let size = base + usize::from(i < extra);
        if size == 0 {
            break;
        }
        chunks.push(rest.by_ref().take(size).collect());
    }
    chunks
}

/// Returns true unless the device carries both the label and the status entry
pub fn needs_binding(device: &EdgeDevice, workload: &str) -> bool {
    let labeled = device
        .metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(&workload_label(workload)));
    let listed = device.status.as_ref().is_some_and(|s| s.has_workload(workload));
    !(labeled && listed)
}

async fn refetch(store: &dyn FleetStore, device: &EdgeDevice) -> Result<Option<EdgeDevice>, StoreError> {
    store
        .get_device(
            device.metadata.namespace.as_deref().unwrap_or_default(),
            device.metadata.name.as_deref().unwrap_or_default(),
        )
        .await
}

/// Patch the device status with `edit`, re-reading on conflict
///
/// `edit` returns false when the status is already as wanted. Returns the
/// latest known copy of the device, or `None` if it disappeared.
pub async fn patch_status_with_retry(
    store: &dyn FleetStore,
    device: &EdgeDevice,
    edit: impl Fn(&mut EdgeDeviceStatus) -> bool,
) -> Result<Option<EdgeDevice>, StoreError> {
    let mut current = device.clone();
    for attempt in 1..=CONFLICT_ATTEMPTS {
        let mut status = current.status.clone().unwrap_or_default();
        if !edit(&mut status) {
            return Ok(Some(current));
        }
        match store.patch_device_status(&current, &status).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() && attempt < CONFLICT_ATTEMPTS => {
                debug!("Status conflict on {}, re-reading (attempt {})", resource_key(&current), attempt);
                match refetch(store, &current).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(None),
                }
            }
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Conflict(resource_key(&current)))
}

/// Patch the device labels with the change computed by `diff`, re-reading on
/// conflict
///
/// `diff` returns `None` when the labels are already as wanted.
pub async fn patch_labels_with_retry(
    store: &dyn FleetStore,
    device: &EdgeDevice,
    diff: impl Fn(&BTreeMap<String, String>) -> Option<LabelPatch>,
) -> Result<Option<EdgeDevice>, StoreError> {
    let mut current = device.clone();
    for attempt in 1..=CONFLICT_ATTEMPTS {
        let labels = current.metadata.labels.clone().unwrap_or_default();
        let Some(patch) = diff(&labels) else {
            return Ok(Some(current));
        };
        match store.patch_device_labels(&current, &patch).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() && attempt < CONFLICT_ATTEMPTS => {
                debug!("Label conflict on {}, re-reading (attempt {})", resource_key(&current), attempt);
                match refetch(store, &current).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(None),
                }
            }
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Conflict(resource_key(&current)))
}

/// Add `workload` to the device: a `Deploying` status entry and the
/// `workload/<name>` label
pub async fn bind_device(
    store: &dyn FleetStore,
    device: &EdgeDevice,
    workload: &str,
) -> Result<Option<EdgeDevice>, StoreError> {
    let Some(device) = patch_status_with_retry(store, device, |status| {
        if status.has_workload(workload) {
            return false;
        }
        status.workloads.push(WorkloadStatusEntry::deploying(workload));
        true
    })
    .await?
    else {
        return Ok(None);
    };

    let label = workload_label(workload);
    patch_labels_with_retry(store, &device, |labels| {
        (!labels.contains_key(&label)).then(|| LabelPatch::from([(label.clone(), Some(LABEL_TRUE.to_string()))]))
    })
    .await
}

/// Remove `workload` from the device status and labels
pub async fn unbind_device(
    store: &dyn FleetStore,
    device: &EdgeDevice,
    workload: &str,
) -> Result<Option<EdgeDevice>, StoreError> {
    let Some(device) = patch_status_with_retry(store, device, |status| {
        let before = status.workloads.len();
        status.workloads.retain(|w| w.name != workload);
        status.workloads.len() != before
    })
    .await?
    else {
        return Ok(None);
    };

    let label = workload_label(workload);
    patch_labels_with_retry(store, &device, |labels| {
        labels
            .contains_key(&label)
            .then(|| LabelPatch::from([(label.clone(), None)]))
    })
    .await
}

/// Remove every workload binding from the device
pub async fn strip_bindings(store: &dyn FleetStore, device: &EdgeDevice) -> Result<Option<EdgeDevice>, StoreError> {
    let Some(device) = patch_status_with_retry(store, device, |status| {
        let had = !status.workloads.is_empty();
        status.workloads.clear();
        had
    })
    .await?
    else {
        return Ok(None);
    };

    patch_labels_with_retry(store, &device, |labels| {
        let patch: LabelPatch = labels
            .keys()
            .filter(|k| k.starts_with(WORKLOAD_LABEL_PREFIX))
            .map(|k| (k.clone(), None))
            .collect();
        (!patch.is_empty()).then_some(patch)
    })
    .await
}

#[cfg(test)]
#[path = "reconcile_helpers_test.rs"]
mod reconcile_helpers_test;
