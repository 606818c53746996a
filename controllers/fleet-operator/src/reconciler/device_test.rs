//! Unit tests for device label reconciliation

use super::*;
use crate::test_utils::{device_labels, device_workloads, reconciler};
use crds::labels::DEVICE_WORKLOAD_FINALIZER;
use fleet_store::mock::fixtures::{bound_device, device, workload_for_device, workload_with_labels, workload_with_selector};
use fleet_store::{FleetStore, MockFleetStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

async fn reconcile(r: &Reconciler, store: &MockFleetStore, name: &str) -> Result<Action, ControllerError> {
    let device = store.get_device("edge", name).await.unwrap().unwrap();
    r.reconcile_device(&device).await
}

/// Store a workload with its selector projection already in place
async fn projected(r: &Reconciler, store: &MockFleetStore, workload: crds::EdgeWorkload) {
    let name = workload.metadata.name.clone().unwrap();
    store.put_workload(workload);
    let w = store.get_workload("edge", &name).await.unwrap().unwrap();
    r.reconcile_workload(&w).await.unwrap();
}

#[tokio::test]
async fn test_label_flip_binds_then_unbinds() {
    let (r, store, events) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[]));
    projected(&r, &store, workload_with_labels("edge", "nginx", &[("tier", "edge")])).await;

    reconcile(&r, &store, "edge-01").await.unwrap();
    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());

    let mut labeled = store.get_device("edge", "edge-01").await.unwrap().unwrap();
    labeled.metadata.labels = Some([("tier".to_string(), "edge".to_string())].into());
    store.put_device(labeled);
    reconcile(&r, &store, "edge-01").await.unwrap();
    assert_eq!(device_workloads(&store, "edge", "edge-01").await, vec!["nginx"]);
    assert!(device_labels(&store, "edge", "edge-01").await.contains_key("workload/nginx"));

    let mut unlabeled = store.get_device("edge", "edge-01").await.unwrap().unwrap();
    unlabeled.metadata.labels.as_mut().unwrap().remove("tier");
    store.put_device(unlabeled);
    reconcile(&r, &store, "edge-01").await.unwrap();
    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());
    assert!(!device_labels(&store, "edge", "edge-01").await.contains_key("workload/nginx"));

    let reasons: Vec<_> = events.events().into_iter().map(|e| e.reason).collect();
    assert_eq!(reasons, vec!["WorkloadBound", "WorkloadUnbound"]);
}

#[tokio::test]
async fn test_multiple_workloads_and_pinning() {
    let (r, store, _) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[("tier", "edge")]));
    projected(&r, &store, workload_with_labels("edge", "nginx", &[("tier", "edge")])).await;
    projected(&r, &store, workload_for_device("edge", "agent", "edge-01")).await;
    projected(&r, &store, workload_for_device("edge", "other", "edge-02")).await;

    reconcile(&r, &store, "edge-01").await.unwrap();

    assert_eq!(device_workloads(&store, "edge", "edge-01").await, vec!["agent", "nginx"]);
}

#[tokio::test]
async fn test_prefixed_selector_key_binds() {
    let (r, store, _) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[("kubernetes.io/arch", "arm64")]));
    store.put_device(device("edge", "edge-02", &[("kubernetes.io/arch", "amd64")]));
    projected(&r, &store, workload_with_labels("edge", "nginx", &[("kubernetes.io/arch", "arm64")])).await;

    let w = store.get_workload("edge", "nginx").await.unwrap().unwrap();
    assert!(w.metadata.labels.unwrap().contains_key("selector/kubernetes.io.arch"));

    reconcile(&r, &store, "edge-01").await.unwrap();
    reconcile(&r, &store, "edge-02").await.unwrap();

    assert_eq!(device_workloads(&store, "edge", "edge-01").await, vec!["nginx"]);
    assert!(device_workloads(&store, "edge", "edge-02").await.is_empty());
}

#[tokio::test]
async fn test_does_not_exist_workloads_are_candidates() {
    let (r, store, _) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[("zone", "a")]));
    projected(
        &r,
        &store,
        workload_with_selector(
            "edge",
            "nginx",
            LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: "retired".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                }]),
                ..Default::default()
            },
        ),
    )
    .await;

    reconcile(&r, &store, "edge-01").await.unwrap();
    assert_eq!(device_workloads(&store, "edge", "edge-01").await, vec!["nginx"]);
}

#[tokio::test]
async fn test_stale_binding_without_workload_is_removed() {
    let (r, store, _) = reconciler(5);
    store.put_device(bound_device("edge", "edge-01", &[("tier", "edge")], &["ghost"]));

    reconcile(&r, &store, "edge-01").await.unwrap();

    assert!(device_workloads(&store, "edge", "edge-01").await.is_empty());
    assert!(!device_labels(&store, "edge", "edge-01").await.contains_key("workload/ghost"));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (r, store, _) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[("tier", "edge")]));
    projected(&r, &store, workload_with_labels("edge", "nginx", &[("tier", "edge")])).await;
    reconcile(&r, &store, "edge-01").await.unwrap();

    let patches = (store.status_patch_count(), store.label_patch_count());
    reconcile(&r, &store, "edge-01").await.unwrap();
    assert_eq!((store.status_patch_count(), store.label_patch_count()), patches);
}

#[tokio::test]
async fn test_deleted_device_releases_connection_finalizer() {
    let (r, store, _) = reconciler(5);
    let mut d = bound_device("edge", "edge-01", &[("tier", "edge")], &["nginx"]);
    d.metadata.finalizers = Some(vec![
        DEVICE_CONNECTION_FINALIZER.to_string(),
        DEVICE_WORKLOAD_FINALIZER.to_string(),
    ]);
    store.put_device(d);
    store.delete_device("edge", "edge-01");

    reconcile(&r, &store, "edge-01").await.unwrap();

    let gone = store.get_device("edge", "edge-01").await.unwrap().unwrap();
    assert_eq!(gone.metadata.finalizers, Some(vec![DEVICE_WORKLOAD_FINALIZER.to_string()]));
    assert!(gone.status.unwrap().workloads.is_empty());
    assert!(!gone.metadata.labels.unwrap().contains_key("workload/nginx"));

    // Nothing left to do until the agent calls in
    let patches = store.status_patch_count() + store.label_patch_count();
    reconcile(&r, &store, "edge-01").await.unwrap();
    assert_eq!(store.status_patch_count() + store.label_patch_count(), patches);
}

#[tokio::test]
async fn test_transient_error_fails_the_reconcile() {
    let (r, store, _) = reconciler(5);
    store.put_device(device("edge", "edge-01", &[]));
    let d = store.get_device("edge", "edge-01").await.unwrap().unwrap();

    store.inject_failures(1);
    assert!(matches!(r.reconcile_device(&d).await, Err(ControllerError::Store(_))));
}
