//! EdgeDeviceSet CRD
//!
//! Defaults applied to every device labeled `edgefleet/member-of=<set>`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::edge_device::{
    HeartbeatConfiguration, LogCollectionConfig, MetricsConfiguration, OsInformation,
    StorageConfiguration,
};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "EdgeDeviceSet",
    namespaced,
    shortname = "eds"
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_information: Option<OsInformation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfiguration>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_collection: BTreeMap<String, LogCollectionConfig>,
}
