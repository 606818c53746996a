//! Secret and ConfigMap references of a pod specification

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fleet_store::FleetStore;
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::AssemblyError;
use crate::models::SecretDescriptor;

/// How a pod uses one Secret
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretUse {
    /// True only when every reference to the Secret is optional
    pub optional: bool,
    /// Keys that must be present
    pub required_keys: BTreeSet<String>,
}

fn containers(pod: &PodSpec) -> impl Iterator<Item = &Container> {
    pod.init_containers.iter().flatten().chain(pod.containers.iter())
}

fn note(uses: &mut BTreeMap<String, SecretUse>, name: &str, optional: bool, key: Option<&str>) {
    let entry = uses.entry(name.to_string()).or_insert(SecretUse {
        optional: true,
        required_keys: BTreeSet::new(),
    });
    if !optional {
        entry.optional = false;
        if let Some(key) = key {
            entry.required_keys.insert(key.to_string());
        }
    }
}

/// Secrets referenced through `envFrom.secretRef` and `secretKeyRef`
pub fn secret_uses(pod: &PodSpec) -> BTreeMap<String, SecretUse> {
    let mut uses = BTreeMap::new();
    for container in containers(pod) {
        for source in container.env_from.iter().flatten() {
            if let Some(r) = &source.secret_ref {
                note(&mut uses, &r.name, r.optional.unwrap_or(false), None);
            }
        }
        for var in container.env.iter().flatten() {
            if let Some(r) = var.value_from.as_ref().and_then(|v| v.secret_key_ref.as_ref()) {
                note(&mut uses, &r.name, r.optional.unwrap_or(false), Some(&r.key));
            }
        }
    }
    uses
}

/// Merge the secret uses of several pods
pub fn merge_uses(into: &mut BTreeMap<String, SecretUse>, other: BTreeMap<String, SecretUse>) {
    for (name, usage) in other {
        match into.get_mut(&name) {
            Some(existing) => {
                existing.optional &= usage.optional;
                existing.required_keys.extend(usage.required_keys);
            }
            None => {
                into.insert(name, usage);
            }
        }
    }
}

/// Read every used Secret and encode its values
///
/// Optional Secrets that do not exist are dropped; a missing mandatory
/// Secret or key is a configuration error.
pub async fn resolve_secrets(
    store: &dyn FleetStore,
    namespace: &str,
    uses: &BTreeMap<String, SecretUse>,
) -> Result<Vec<SecretDescriptor>, AssemblyError> {
    let mut out = Vec::with_capacity(uses.len());
    for (name, usage) in uses {
        let Some(secret) = store.get_secret(namespace, name).await? else {
            if usage.optional {
                continue;
            }
            return Err(AssemblyError::Configuration(format!(
                "secret {namespace}/{name} not found"
            )));
        };
        let data = secret.data.unwrap_or_default();
        if let Some(key) = usage.required_keys.iter().find(|k| !data.contains_key(*k)) {
            return Err(AssemblyError::Configuration(format!(
                "secret {namespace}/{name} has no key {key}"
            )));
        }
        out.push(SecretDescriptor {
            name: name.clone(),
            data: data
                .into_iter()
                .map(|(k, v)| (k, STANDARD.encode(v.0)))
                .collect(),
        });
    }
    Ok(out)
}

/// ConfigMaps referenced by volumes, `envFrom` and `configMapKeyRef`,
/// mapped to whether every reference is optional
pub fn config_map_uses(pod: &PodSpec) -> BTreeMap<String, bool> {
    let mut uses: BTreeMap<String, bool> = BTreeMap::new();
    let mut mark = |name: &str, optional: Option<bool>| {
        let optional = optional.unwrap_or(false);
        uses.entry(name.to_string())
            .and_modify(|o| *o &= optional)
            .or_insert(optional);
    };

    for volume in pod.volumes.iter().flatten() {
        if let Some(cm) = &volume.config_map {
            mark(&cm.name, cm.optional);
        }
    }
    for container in containers(pod) {
        for source in container.env_from.iter().flatten() {
            if let Some(r) = &source.config_map_ref {
                mark(&r.name, r.optional);
            }
        }
        for var in container.env.iter().flatten() {
            if let Some(r) = var.value_from.as_ref().and_then(|v| v.config_map_key_ref.as_ref()) {
                mark(&r.name, r.optional);
            }
        }
    }
    uses
}

/// Read referenced ConfigMaps and render each as YAML
pub async fn resolve_config_maps(
    store: &dyn FleetStore,
    namespace: &str,
    uses: &BTreeMap<String, bool>,
) -> Result<Vec<String>, AssemblyError> {
    let mut out = Vec::with_capacity(uses.len());
    for (name, optional) in uses {
        let Some(cm) = store.get_config_map(namespace, name).await? else {
            if *optional {
                continue;
            }
            return Err(AssemblyError::Configuration(format!(
                "configmap {namespace}/{name} not found"
            )));
        };
        // Server-side metadata means nothing to the agent
        let trimmed = ConfigMap {
            metadata: ObjectMeta {
                name: cm.metadata.name,
                namespace: cm.metadata.namespace,
                labels: cm.metadata.labels,
                ..Default::default()
            },
            data: cm.data,
            binary_data: cm.binary_data,
            immutable: cm.immutable,
        };
        let yaml = serde_yaml::to_string(&trimmed)
            .map_err(|e| AssemblyError::Configuration(format!("configmap {namespace}/{name}: {e}")))?;
        out.push(yaml);
    }
    Ok(out)
}
