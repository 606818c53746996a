//! EdgeConfig CRD
//!
//! Free-form configuration bundle a fleet administrator can publish next to
//! devices. Stored only.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "EdgeConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeConfigSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}
