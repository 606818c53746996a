//! EdgeAutoConfig CRD
//!
//! Declares workload templates that are materialised once per member device
//! of `spec.deviceSet` whose hardware labels match `spec.properties`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::edge_workload::EdgeWorkloadSpec;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "EdgeAutoConfig",
    namespaced,
    status = "EdgeAutoConfigStatus",
    shortname = "eac"
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeAutoConfigSpec {
    /// `EdgeDeviceSet` whose members are considered
    pub device_set: String,

    /// Hardware label suffixes and the values a device must carry, e.g.
    /// `cpu-architecture: arm64` matches `device.cpu-architecture=arm64`
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Workloads created for each matching device
    #[serde(default)]
    pub workloads: Vec<WorkloadTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTemplate {
    /// Prefix of the generated workload name (`<name>-<device>`)
    pub name: String,

    /// Workload spec; `device` is overwritten with the target device
    pub spec: EdgeWorkloadSpec,
}

impl WorkloadTemplate {
    /// Name of the workload materialised for `device`
    pub fn workload_name(&self, device: &str) -> String {
        format!("{}-{}", self.name, device)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeAutoConfigStatus {
    #[serde(default)]
    pub devices: Vec<AutoConfigDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoConfigDevice {
    pub name: String,
    pub state: AutoConfigDeviceState,
}

/// Progress of a device through an auto-config
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoConfigDeviceState {
    /// Workloads created, not yet all running
    #[default]
    Pending,
    /// Every templated workload reports `Running`
    Running,
}
