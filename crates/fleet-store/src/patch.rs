//! JSON merge patch bodies
//!
//! Every body embeds `metadata.resourceVersion` taken from the caller's
//! pre-image; the API server rejects the patch with 409 when the object has
//! moved on.

use kube::Resource;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::store_trait::LabelPatch;

/// Namespace, name and resourceVersion of an object about to be patched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
}

impl ObjectKey {
    /// Extract the key, failing for objects that were never persisted
    pub fn of<K: Resource>(obj: &K) -> Result<Self, StoreError> {
        let meta = obj.meta();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| StoreError::InvalidRequest("object has no name".to_string()))?;
        let namespace = meta.namespace.clone().ok_or_else(|| {
            StoreError::InvalidRequest(format!("object {name} has no namespace"))
        })?;
        let resource_version = meta.resource_version.clone().ok_or_else(|| {
            StoreError::InvalidRequest(format!("object {namespace}/{name} has no resourceVersion"))
        })?;
        Ok(Self {
            namespace,
            name,
            resource_version,
        })
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `metadata.labels` merge patch
pub fn labels_patch(resource_version: &str, labels: &LabelPatch) -> Value {
    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "labels": labels,
        }
    })
}

/// `metadata.finalizers` merge patch (lists are replaced wholesale)
pub fn finalizers_patch(resource_version: &str, finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "finalizers": finalizers,
        }
    })
}

/// Status subresource merge patch
pub fn status_patch<S: Serialize>(resource_version: &str, status: &S) -> Result<Value, StoreError> {
    Ok(json!({
        "metadata": {
            "resourceVersion": resource_version,
        },
        "status": serde_json::to_value(status)?,
    }))
}

/// Apply a label patch to a label map in place
pub fn apply_label_patch(labels: &mut BTreeMap<String, String>, patch: &LabelPatch) {
    for (k, v) in patch {
        match v {
            Some(v) => {
                labels.insert(k.clone(), v.clone());
            }
            None => {
                labels.remove(k);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::EdgeDevice;

    #[test]
    fn test_labels_patch_nulls_removed_keys() {
        let patch = LabelPatch::from([
            ("workload/nginx".to_string(), Some("true".to_string())),
            ("workload/old".to_string(), None),
        ]);
        assert_eq!(
            labels_patch("42", &patch),
            json!({
                "metadata": {
                    "resourceVersion": "42",
                    "labels": {"workload/nginx": "true", "workload/old": null}
                }
            })
        );
    }

    #[test]
    fn test_object_key_requires_resource_version() {
        let mut device = EdgeDevice::new("edge-01", Default::default());
        device.metadata.namespace = Some("edge".into());
        assert!(matches!(ObjectKey::of(&device), Err(StoreError::InvalidRequest(_))));

        device.metadata.resource_version = Some("7".into());
        let key = ObjectKey::of(&device).unwrap();
        assert_eq!(key.to_string(), "edge/edge-01");
        assert_eq!(key.resource_version, "7");
    }

    #[test]
    fn test_apply_label_patch() {
        let mut labels = BTreeMap::from([("a".to_string(), "1".to_string())]);
        apply_label_patch(
            &mut labels,
            &LabelPatch::from([("a".to_string(), None), ("b".to_string(), Some("2".to_string()))]),
        );
        assert_eq!(labels, BTreeMap::from([("b".to_string(), "2".to_string())]));
    }
}
