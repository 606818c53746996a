//! Unit tests for workload reconciliation

use super::*;
use crate::test_utils::{device_labels, device_workloads, reconciler};
use fleet_store::mock::fixtures::{bound_device, device, workload_for_device, workload_with_labels, workload_with_selector};
use fleet_store::{FleetStore, MockFleetStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

async fn reconcile(r: &Reconciler, store: &MockFleetStore, name: &str) -> Result<Action, ControllerError> {
    let workload = store.get_workload("edge", name).await.unwrap().unwrap();
    r.reconcile_workload(&workload).await
}

/// Projection pass followed by the binding pass
async fn converge(r: &Reconciler, store: &MockFleetStore, name: &str) {
    reconcile(r, store, name).await.unwrap();
    reconcile(r, store, name).await.unwrap();
}

fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
    LabelSelectorRequirement {
        key: key.to_string(),
        operator: operator.to_string(),
        values: (!values.is_empty()).then(|| values.iter().map(|v| (*v).to_string()).collect()),
    }
}

#[tokio::test]
async fn test_projection_is_patched_first() {
    let (r, store, _) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[("tier", "edge")]));
    store.put_workload(workload_with_labels("edge", "nginx", &[("tier", "edge")]));

    let action = reconcile(&r, &store, "nginx").await.unwrap();
    assert_eq!(action, Action::await_change());

    let w = store.get_workload("edge", "nginx").await.unwrap().unwrap();
    assert_eq!(w.metadata.labels.unwrap().get("selector/tier").map(String::as_str), Some("true"));
    // Nothing bound until the projection is canonical
    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());
}

#[tokio::test]
async fn test_selector_fan_out() {
    let (r, store, events) = reconciler(5);
    for i in 0..100 {
        let name = format!("edge-{i:03}");
        let labels: &[(&str, &str)] = if i % 3 == 0 { &[("tier", "edge")] } else { &[("tier", "core")] };
        store.put_device(device("edge", &name, labels));
    }
    store.put_workload(workload_with_labels("edge", "nginx", &[("tier", "edge")]));

    converge(&r, &store, "nginx").await;

    let bound = store.list_devices_by_workload("edge", "nginx").await.unwrap();
    assert_eq!(bound.len(), 34);
    for d in store.devices("edge") {
        let name = d.metadata.name.clone().unwrap();
        let edge = d.metadata.labels.as_ref().unwrap().get("tier").map(String::as_str) == Some("edge");
        assert_eq!(device_workloads(&store, "edge", &name).await == vec!["nginx"], edge, "{name}");
    }
    assert_eq!(events.events().len(), 34);

    let w = store.get_workload("edge", "nginx").await.unwrap().unwrap();
    assert!(w.metadata.finalizers.unwrap().contains(&WORKLOAD_FINALIZER.to_string()));
}

#[tokio::test]
async fn test_reconcile_twice_is_a_no_op() {
    let (r, store, _) = reconciler(3);
    store.put_device(device("edge", "edge-01", &[("tier", "edge")]));
    store.put_workload(workload_with_labels("edge", "nginx", &[("tier", "edge")]));
    converge(&r, &store, "nginx").await;

    let patches = (store.status_patch_count(), store.label_patch_count());
    reconcile(&r, &store, "nginx").await.unwrap();
    assert_eq!((store.status_patch_count(), store.label_patch_count()), patches);
}

#[tokio::test]
async fn test_devices_no_longer_matching_are_unbound() {
    let (r, store, _) = reconciler(5);
    store.put_device(bound_device("edge", "edge-01", &[("tier", "core")], &["nginx"]));
    store.put_device(bound_device("edge", "edge-02", &[("tier", "edge")], &["nginx"]));
    store.put_workload(workload_with_labels("edge", "nginx", &[("tier", "edge")]));

    converge(&r, &store, "nginx").await;

    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());
    assert!(!device_labels(&store, "edge", "edge-01").await.contains_key("workload/nginx"));
    assert_eq!(device_workloads(&store, "edge", "edge-02").await, vec!["nginx"]);
}

#[tokio::test]
async fn test_bound_devices_keep_other_workloads() {
    let (r, store, _) = reconciler(5);
    store.put_device(bound_device("edge", "edge-01", &[("tier", "edge")], &["agent"]));
    store.put_workload(workload_with_labels("edge", "nginx", &[("tier", "edge")]));

    converge(&r, &store, "nginx").await;

    assert_eq!(device_workloads(&store, "edge", "edge-01").await, vec!["agent", "nginx"]);
}

#[tokio::test]
async fn test_workload_pinned_to_device() {
    let (r, store, _) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[]));
    store.put_device(device("edge", "edge-02", &[]));
    store.put_workload(workload_for_device("edge", "nginx", "edge-02"));

    converge(&r, &store, "nginx").await;

    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());
    assert_eq!(device_workloads(&store, "edge", "edge-02").await, vec!["nginx"]);
    let w = store.get_workload("edge", "nginx").await.unwrap().unwrap();
    assert_eq!(
        w.metadata.labels.unwrap().get("selector/devicename").map(String::as_str),
        Some("edge-02")
    );
}

#[tokio::test]
async fn test_does_not_exist_selector() {
    let (r, store, _) = reconciler(2);
    store.put_device(device("edge", "edge-01", &[("retired", "yes")]));
    store.put_device(device("edge", "edge-02", &[("zone", "a")]));
    store.put_workload(workload_with_selector(
        "edge",
        "nginx",
        LabelSelector {
            match_expressions: Some(vec![requirement("retired", "DoesNotExist", &[])]),
            ..Default::default()
        },
    ));

    converge(&r, &store, "nginx").await;

    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());
    assert_eq!(device_workloads(&store, "edge", "edge-02").await, vec!["nginx"]);
}

#[tokio::test]
async fn test_empty_selector_binds_nothing() {
    let (r, store, _) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[("tier", "edge")]));
    store.put_workload(workload_with_selector("edge", "nginx", LabelSelector::default()));

    // Empty projection: the first pass already binds
    reconcile(&r, &store, "nginx").await.unwrap();
    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());
}

#[tokio::test]
async fn test_invalid_selector_is_reported_not_retried() {
    let (r, store, events) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[("tier", "edge")]));
    store.put_workload(workload_with_selector(
        "edge",
        "nginx",
        LabelSelector {
            match_expressions: Some(vec![requirement("tier", "Near", &["edge"])]),
            ..Default::default()
        },
    ));

    converge(&r, &store, "nginx").await;

    let warnings = events.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].object, "edge/nginx");
    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());
}

#[tokio::test]
async fn test_transient_store_error_fails_the_reconcile() {
    let (r, store, _) = reconciler(5);
    store.put_workload(workload_with_labels("edge", "nginx", &[("tier", "edge")]));
    let w = store.get_workload("edge", "nginx").await.unwrap().unwrap();

    store.inject_failures(1);
    assert!(matches!(r.reconcile_workload(&w).await, Err(ControllerError::Store(_))));
}

#[tokio::test]
async fn test_deletion_waits_for_teardown() {
    let (r, store, _) = reconciler(2);
    for name in ["edge-01", "edge-02", "edge-03"] {
        store.put_device(device("edge", name, &[("tier", "edge")]));
    }
    store.put_workload(workload_with_labels("edge", "nginx", &[("tier", "edge")]));
    converge(&r, &store, "nginx").await;
    assert_eq!(store.list_devices_by_workload("edge", "nginx").await.unwrap().len(), 3);

    store.delete_workload("edge", "nginx");
    // Finalizer holds the workload while devices still carry it
    let w = store.get_workload("edge", "nginx").await.unwrap().unwrap();
    assert!(w.metadata.deletion_timestamp.is_some());

    r.reconcile_workload(&w).await.unwrap();

    assert!(store.list_devices_by_workload("edge", "nginx").await.unwrap().is_empty());
    for name in ["edge-01", "edge-02", "edge-03"] {
        assert!(device_workloads(&store, "edge", name).await.is_empty());
    }
    assert!(store.get_workload("edge", "nginx").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_teardown_keeps_finalizer() {
    let (r, store, _) = reconciler(1);
    store.put_device(device("edge", "edge-01", &[("tier", "edge")]));
    store.put_workload(workload_with_labels("edge", "nginx", &[("tier", "edge")]));
    converge(&r, &store, "nginx").await;

    store.delete_workload("edge", "nginx");
    let w = store.get_workload("edge", "nginx").await.unwrap().unwrap();

    store.inject_failures(1);
    assert!(r.reconcile_workload(&w).await.is_err());
    assert!(store.get_workload("edge", "nginx").await.unwrap().is_some());

    let w = store.get_workload("edge", "nginx").await.unwrap().unwrap();
    r.reconcile_workload(&w).await.unwrap();
    assert!(store.get_workload("edge", "nginx").await.unwrap().is_none());
}
