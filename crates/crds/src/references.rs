//! Object references shared by EdgeFleet CRDs
//!
//! Workloads, devices and device sets point at Secrets, ConfigMaps and
//! other EdgeFleet resources by name. Two reference shapes are used: a bare
//! `LocalObjectReference`-style name (same namespace) and a typed reference
//! carrying `apiGroup` and `kind` for cross-kind links.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace by name
///
/// Follows the Kubernetes `LocalObjectReference` shape.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NameRef {
    /// Name of the referenced object
    pub name: String,
}

impl NameRef {
    /// Create a reference to `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Typed reference to an EdgeFleet resource
///
/// This follows the Kubernetes `TypedLocalObjectReference` pattern:
/// - `apiGroup`: the API group of the referenced resource
/// - `kind`: the kind of the referenced resource (e.g. "EdgeDeviceSet")
/// - `name`: the name of the referenced resource
/// - `namespace`: optional, defaults to the referencing resource's namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FleetResourceReference {
    /// API group of the referenced resource
    pub api_group: String,

    /// Kind of the referenced resource
    pub kind: String,

    /// Name of the referenced resource
    pub name: String,

    /// Namespace of the referenced resource (defaults to same namespace as the referencing resource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl FleetResourceReference {
    /// Reference to an EdgeFleet resource in the same API group and namespace
    pub fn fleet(kind: &str, name: impl Into<String>) -> Self {
        Self {
            api_group: crate::API_GROUP.to_string(),
            kind: kind.to_string(),
            name: name.into(),
            namespace: None,
        }
    }

    /// Same as [`FleetResourceReference::fleet`] with an explicit namespace
    pub fn fleet_in(kind: &str, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::fleet(kind, name)
        }
    }

    /// Resolve the namespace, falling back to the referencing object's
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}
