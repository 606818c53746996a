//! Agent wire models
//!
//! Agents speak a message envelope over HTTPS: every request and response
//! body is a [`Message`] whose `content` depends on the `directive`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crds::{
    DataConfiguration, Hardware, HeartbeatConfiguration, Mount, OsInformation,
    PlaybookExecutionStatusEntry, Retention,
};
use serde::{Deserialize, Serialize};

/// Envelope version written by the gateway
pub const MESSAGE_VERSION: u32 = 1;

/// Directives an agent may post on the data channel
pub mod directives {
    pub const ENROLMENT: &str = "enrolment";
    pub const REGISTRATION: &str = "registration";
    pub const HEARTBEAT: &str = "heartbeat";
    /// Directive of configuration responses
    pub const CONFIGURATION: &str = "configuration";
    /// Directive of control responses
    pub const CONTROL: &str = "control";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    #[default]
    Data,
    Command,
    Event,
    ConnectionStatus,
}

/// Message envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Message {
    #[serde(rename = "type", default)]
    pub type_: MessageType,

    #[serde(default)]
    pub message_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,

    #[serde(default)]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<DateTime<Utc>>,

    #[serde(default)]
    pub directive: String,

    #[serde(default)]
    pub content: serde_json::Value,
}

impl Message {
    /// Response envelope carrying `content`
    pub fn reply(type_: MessageType, directive: &str, content: serde_json::Value) -> Self {
        Self {
            type_,
            message_id: uuid::Uuid::new_v4().to_string(),
            response_to: None,
            version: MESSAGE_VERSION,
            sent: Some(Utc::now()),
            directive: directive.to_string(),
            content,
        }
    }

    /// Decode `content` into a directive payload
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.content.clone())
    }
}

/// `enrolment` payload
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrolmentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<EnrolmentFeatures>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrolmentFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

/// `registration` payload
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationInfo {
    /// PEM-encoded CSR
    pub certificate_request: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,
}

/// `registration` response content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    /// PEM-encoded device certificate
    pub certificate: String,
}

/// `heartbeat` payload
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Agent-reported device phase
    #[serde(default)]
    pub status: String,

    /// Configuration version the agent last applied
    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,

    #[serde(default)]
    pub workloads: Vec<WorkloadReport>,

    #[serde(default)]
    pub playbook_executions: Vec<PlaybookExecutionStatusEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeReport>,

    #[serde(default)]
    pub events: Vec<EventReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReport {
    pub name: String,

    /// Raw phase string; unknown values map to `Unknown`
    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_upload: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_commit_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventReport {
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// `info` or `warn`
    #[serde(rename = "type", default)]
    pub type_: String,
}

impl EventReport {
    pub fn is_warning(&self) -> bool {
        self.type_.eq_ignore_ascii_case("warn") || self.type_.eq_ignore_ascii_case("warning")
    }
}

/// Control channel command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlCommand {
    pub command: String,
}

impl ControlCommand {
    pub fn disconnect() -> Self {
        Self {
            command: "disconnect".to_string(),
        }
    }
}

/// Full desired configuration of a device
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigurationMessage {
    pub device_id: String,

    /// resourceVersion of the device the configuration was built from
    pub version: String,

    pub configuration: DeviceConfiguration,

    #[serde(default)]
    pub workloads: Vec<WorkloadDescriptor>,

    #[serde(default)]
    pub secrets: Vec<SecretDescriptor>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub playbook_executions: Vec<PlaybookExecutionDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfiguration {
    pub heartbeat: HeartbeatConfiguration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInformation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsDescriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_collection: BTreeMap<String, LogCollectionDescriptor>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageDescriptor {
    pub s3: S3StorageDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageDescriptor {
    pub bucket_name: String,
    pub bucket_host: String,
    pub bucket_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_region: Option<String>,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    /// Base64 CA bundle for the bucket endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_ca_bundle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,

    pub system: SystemMetricsDescriptor,

    pub receiver: MetricsReceiverDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetricsDescriptor {
    pub interval: i32,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<AllowList>,
}

/// Metric names a collector may forward
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AllowList {
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReceiverDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub request_num_samples: i64,

    pub timeout_seconds: i64,

    /// PEM CA used to verify an HTTPS receiver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

impl Default for MetricsReceiverDescriptor {
    fn default() -> Self {
        Self {
            url: None,
            request_num_samples: 30_000,
            timeout_seconds: 10,
            ca_cert: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectionDescriptor {
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog: Option<SyslogDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyslogDescriptor {
    pub address: String,
    pub protocol: String,
}

/// One workload as the agent runs it
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDescriptor {
    pub name: String,

    pub namespace: String,

    /// `podman/*` labels with the prefix stripped
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Pod specification as YAML
    pub specification: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataConfiguration>,

    /// Registry auth file contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registries: Option<ImageRegistriesDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<WorkloadMetricsDescriptor>,

    /// Referenced ConfigMaps, each as YAML
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configmaps: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_collection: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistriesDescriptor {
    pub auth_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadMetricsDescriptor {
    pub path: String,
    pub port: i32,
    pub interval: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<AllowList>,
}

/// Secret referenced by a workload; values are base64 encoded
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretDescriptor {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookExecutionDescriptor {
    pub name: String,
    /// Base64 playbook content
    pub playbook: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}
