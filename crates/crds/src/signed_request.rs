//! EdgeDeviceSignedRequest CRD
//!
//! Bootstrap record created the first time an unknown device contacts the
//! gateway with the shared registration certificate. Approval (manual or
//! automatic) turns it into an `EdgeDevice` in the target namespace.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::edge_device::Hardware;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "EdgeDeviceSignedRequest",
    namespaced,
    status = "EdgeDeviceSignedRequestStatus",
    shortname = "edsr",
    printcolumn = r#"{"name":"Approved","type":"boolean","jsonPath":".spec.approved"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceSignedRequestSpec {
    /// Namespace the device is created in once approved
    pub target_namespace: String,

    /// `EdgeDeviceSet` the device joins once approved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_set: Option<String>,

    /// Set by an operator (or auto-approval) to admit the device
    #[serde(default)]
    pub approved: bool,

    /// Hardware fingerprint collected during enrolment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<SignedRequestFeatures>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignedRequestFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceSignedRequestStatus {
    #[serde(default)]
    pub conditions: Vec<SignedRequestCondition>,
}

impl EdgeDeviceSignedRequestStatus {
    /// Status carried by a freshly created request
    pub fn pending() -> Self {
        Self {
            conditions: vec![SignedRequestCondition::new(
                SignedRequestConditionType::Pending,
                "Waiting for approval",
            )],
        }
    }

    /// Returns true if a condition of this type is present and true
    pub fn has_condition(&self, kind: SignedRequestConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == kind && c.status == ConditionStatus::True)
    }

    /// Replace any existing condition of the same type
    pub fn set_condition(&mut self, condition: SignedRequestCondition) {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignedRequestCondition {
    #[serde(rename = "type")]
    pub type_: SignedRequestConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SignedRequestCondition {
    /// A true condition stamped with the current time
    pub fn new(type_: SignedRequestConditionType, message: &str) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
            last_transition_time: Some(Utc::now()),
            message: Some(message.to_string()),
        }
    }
}

/// Lifecycle of a signed request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum SignedRequestConditionType {
    #[default]
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "approved")]
    Approved,
    #[serde(alias = "declined")]
    Declined,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    #[default]
    True,
    False,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut status = EdgeDeviceSignedRequestStatus::pending();
        assert!(status.has_condition(SignedRequestConditionType::Pending));

        status.set_condition(SignedRequestCondition::new(
            SignedRequestConditionType::Approved,
            "approved",
        ));
        status.set_condition(SignedRequestCondition::new(
            SignedRequestConditionType::Approved,
            "approved again",
        ));

        assert_eq!(status.conditions.len(), 2);
        assert!(status.has_condition(SignedRequestConditionType::Approved));
    }

    #[test]
    fn test_condition_type_accepts_lowercase() {
        let t: SignedRequestConditionType = serde_json::from_str("\"approved\"").unwrap();
        assert_eq!(t, SignedRequestConditionType::Approved);
    }
}
