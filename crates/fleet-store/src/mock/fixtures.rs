//! Builders for test objects

use std::collections::BTreeMap;

use crds::{
    EdgeDevice, EdgeDeviceSignedRequest, EdgeDeviceSignedRequestSpec, EdgeDeviceSignedRequestStatus,
    EdgeDeviceSpec, EdgeDeviceStatus, EdgeWorkload, EdgeWorkloadSpec, WorkloadStatusEntry,
};
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;

fn meta(namespace: &str, name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: (!labels.is_empty()).then(|| {
            labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect()
        }),
        ..Default::default()
    }
}

/// Device with the given labels and an empty status
pub fn device(namespace: &str, name: &str, labels: &[(&str, &str)]) -> EdgeDevice {
    EdgeDevice {
        metadata: meta(namespace, name, labels),
        spec: EdgeDeviceSpec::default(),
        status: Some(EdgeDeviceStatus::default()),
    }
}

/// Device already bound to `workloads` (labels and status entries)
pub fn bound_device(namespace: &str, name: &str, labels: &[(&str, &str)], workloads: &[&str]) -> EdgeDevice {
    let mut d = device(namespace, name, labels);
    let device_labels = d.metadata.labels.get_or_insert_with(BTreeMap::new);
    for w in workloads {
        device_labels.insert(crds::labels::workload_label(w), "true".to_string());
    }
    d.status = Some(EdgeDeviceStatus {
        workloads: workloads.iter().map(|w| WorkloadStatusEntry::deploying(w)).collect(),
        ..Default::default()
    });
    d
}

/// Pending signed request for `name` targeting `target_namespace`
pub fn signed_request(namespace: &str, name: &str, target_namespace: &str, approved: bool) -> EdgeDeviceSignedRequest {
    EdgeDeviceSignedRequest {
        metadata: meta(namespace, name, &[]),
        spec: EdgeDeviceSignedRequestSpec {
            target_namespace: target_namespace.to_string(),
            approved,
            ..Default::default()
        },
        status: Some(EdgeDeviceSignedRequestStatus::pending()),
    }
}

/// Single-container pod
pub fn pod(image: &str) -> PodSpec {
    PodSpec {
        containers: vec![Container {
            name: "main".to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Workload selecting devices by `matchLabels`
pub fn workload_with_labels(namespace: &str, name: &str, match_labels: &[(&str, &str)]) -> EdgeWorkload {
    workload_with_selector(
        namespace,
        name,
        LabelSelector {
            match_labels: Some(
                match_labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
    )
}

/// Workload with an arbitrary selector
pub fn workload_with_selector(namespace: &str, name: &str, selector: LabelSelector) -> EdgeWorkload {
    EdgeWorkload {
        metadata: meta(namespace, name, &[]),
        spec: EdgeWorkloadSpec {
            device_selector: Some(selector),
            pod: pod("quay.io/edgefleet/app:latest"),
            ..Default::default()
        },
    }
}

/// Workload pinned to one device
pub fn workload_for_device(namespace: &str, name: &str, device: &str) -> EdgeWorkload {
    EdgeWorkload {
        metadata: meta(namespace, name, &[]),
        spec: EdgeWorkloadSpec {
            device: Some(device.to_string()),
            pod: pod("quay.io/edgefleet/app:latest"),
            ..Default::default()
        },
    }
}

/// Secret with raw byte values
pub fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: meta(namespace, name, &[]),
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// ConfigMap with string values
pub fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: meta(namespace, name, &[]),
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}
