//! EdgeDeviceGroup CRD
//!
//! A named grouping of devices by label selector. Stored and served only;
//! none of the controllers act on it.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "EdgeDeviceGroup",
    namespaced,
    shortname = "edg"
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceGroupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<LabelSelector>,
}
