//! EdgeDevice CRD
//!
//! A registered edge node. The spec carries per-device overrides of the
//! configuration normally inherited from an `EdgeDeviceSet`; the status is
//! written by the gateway (heartbeats) and by the binding controllers
//! (`status.workloads`).

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::references::NameRef;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "EdgeDevice",
    namespaced,
    status = "EdgeDeviceStatus",
    shortname = "ed",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceSpec {
    /// Time the device first asked to join the fleet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_time: Option<DateTime<Utc>>,

    /// Heartbeat cadence override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatConfiguration>,

    /// OS image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_information: Option<OsInformation>,

    /// Storage override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfiguration>,

    /// Metrics override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfiguration>,

    /// Log collectors keyed by collector name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_collection: BTreeMap<String, LogCollectionConfig>,

    /// Host mounts to apply on the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounts: Option<MountConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfiguration {
    /// Seconds between two heartbeats
    pub period_seconds: i64,

    /// Which hardware facts the agent reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_profile: Option<HardwareProfileConfiguration>,
}

impl Default for HeartbeatConfiguration {
    fn default() -> Self {
        Self {
            period_seconds: 60,
            hardware_profile: Some(HardwareProfileConfiguration::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfileConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<bool>,

    /// `full` or `delta`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OsInformation {
    #[serde(default)]
    pub automatically_upgrade: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_object_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfiguration {
    /// External S3 configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3StorageConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageConfiguration {
    /// Secret holding `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// ConfigMap holding `BUCKET_HOST`, `BUCKET_NAME`, `BUCKET_PORT`, `BUCKET_REGION`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,

    /// Whether an object bucket claim is requested for the device
    #[serde(default)]
    pub create_obc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_metrics: Option<SystemMetricsConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_configuration: Option<MetricsReceiverConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    #[serde(default)]
    pub max_mib: i32,

    #[serde(default)]
    pub max_hours: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetricsConfiguration {
    /// Scrape interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i32>,

    #[serde(default)]
    pub disabled: bool,

    /// ConfigMap with a `metrics_list.yaml` allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<NameRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReceiverConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_num_samples: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,

    /// Secret holding `ca.crt` for an HTTPS receiver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectionConfig {
    /// Collector kind, e.g. `syslog`
    pub kind: String,

    /// Buffer size in KiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<i32>,

    /// ConfigMap with `Address` and `Protocol` keys for syslog collectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_config: Option<NameRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MountConfiguration {
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub device: String,
    pub directory: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceStatus {
    /// Device phase as reported by the agent (`up`, `degraded`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Configuration version last applied by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_resource_version: Option<String>,

    /// Hardware profile collected by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,

    /// Workloads bound to this device
    #[serde(default)]
    pub workloads: Vec<WorkloadStatusEntry>,

    /// Object bucket claim provisioned for this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_obc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_information: Option<UpgradeInformation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub playbook_executions: Vec<PlaybookExecutionStatusEntry>,
}

impl EdgeDeviceStatus {
    /// Returns true if a workload entry with this name is present
    pub fn has_workload(&self, name: &str) -> bool {
        self.workloads.iter().any(|w| w.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatusEntry {
    pub name: String,

    pub phase: WorkloadPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_upload: Option<DateTime<Utc>>,
}

impl WorkloadStatusEntry {
    /// Entry appended when a workload is first bound to a device
    pub fn deploying(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: WorkloadPhase::Deploying,
            last_transition_time: Some(Utc::now()),
            last_data_upload: None,
        }
    }
}

/// Workload phase on a device
///
/// Serializes as PascalCase; lowercase phases reported by older agents are
/// accepted. Anything unrecognised maps to `Unknown`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum WorkloadPhase {
    /// Bound by the operator, not yet reported by the agent
    #[default]
    #[serde(alias = "deploying")]
    Deploying,
    #[serde(alias = "created")]
    Created,
    #[serde(alias = "running")]
    Running,
    #[serde(alias = "exited")]
    Exited,
    #[serde(alias = "stopped")]
    Stopped,
    #[serde(alias = "failed")]
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeInformation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_commit_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookExecutionStatusEntry {
    pub name: String,

    #[serde(default)]
    pub conditions: Vec<PlaybookExecutionCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookExecutionCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Hardware fingerprint reported by the agent at enrolment, registration
/// and (optionally) on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hardware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_vendor: Option<SystemVendor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemVendor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    #[serde(default)]
    pub physical_bytes: i64,

    #[serde(default)]
    pub usable_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4_addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}
