//! Test utilities for unit testing reconcilers
//!
//! Reconcilers run against an in-memory store and a recording event
//! publisher; both handles are returned so tests can seed and inspect them.

use std::sync::Arc;

use fleet_store::{MockFleetStore, RecordingEventPublisher};

use crate::reconciler::Reconciler;

/// Reconciler with `workload_concurrency` fan-out over a fresh mock store
pub fn reconciler(workload_concurrency: usize) -> (Reconciler, MockFleetStore, RecordingEventPublisher) {
    let store = MockFleetStore::new();
    let events = RecordingEventPublisher::default();
    let r = Reconciler::new(Arc::new(store.clone()), Arc::new(events.clone()), workload_concurrency);
    (r, store, events)
}

/// Labels of a stored device, empty if it has none or is gone
pub async fn device_labels(store: &MockFleetStore, namespace: &str, name: &str) -> std::collections::BTreeMap<String, String> {
    use fleet_store::FleetStore;
    store
        .get_device(namespace, name)
        .await
        .unwrap()
        .and_then(|d| d.metadata.labels)
        .unwrap_or_default()
}

/// Workload names listed in a stored device's status
pub async fn device_workloads(store: &MockFleetStore, namespace: &str, name: &str) -> Vec<String> {
    use fleet_store::FleetStore;
    store
        .get_device(namespace, name)
        .await
        .unwrap()
        .and_then(|d| d.status)
        .map(|s| s.workloads.into_iter().map(|w| w.name).collect())
        .unwrap_or_default()
}
