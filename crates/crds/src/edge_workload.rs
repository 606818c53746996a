//! EdgeWorkload CRD
//!
//! A pod-shaped unit of work placed on one device (`spec.device`) or on every
//! device whose labels satisfy `spec.deviceSelector`. Placement is purely
//! declarative; the binding controllers keep `workload/<name>` labels on
//! devices in sync with it.

use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::NameRef;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "EdgeWorkload",
    namespaced,
    shortname = "ew"
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeWorkloadSpec {
    /// Exact device name. Takes precedence over `deviceSelector`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Label selector over devices in the workload's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<LabelSelector>,

    /// Pod run by the agent
    pub pod: PodSpec,

    /// Directories synchronised to object storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataConfiguration>,

    /// Registry credentials for pulling the pod images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registries: Option<ImageRegistries>,

    /// Scrape configuration for the workload's metrics endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<WorkloadMetrics>,

    /// Name of a log collector declared on the device or device set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_collection: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataConfiguration {
    #[serde(default)]
    pub paths: Vec<DataPath>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataPath {
    /// Path inside the workload
    pub source: String,

    /// Prefix in the device bucket
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistries {
    /// Secret with a `.dockerconfigjson` entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<NameRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadMetrics {
    /// HTTP path, defaults to `/metrics` on the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    pub port: i32,

    /// Scrape interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i32>,

    /// ConfigMap with a `metrics_list.yaml` allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<NameRef>,
}
