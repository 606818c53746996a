//! Configuration assembler
//!
//! Builds the [`DeviceConfigurationMessage`] answered to a device poll from
//! the device, the workloads bound to it, its device set and every object
//! those reference.
//!
//! Failures split in two: a configuration error (absent mandatory reference,
//! malformed value) is reported as a warning event on the device and is not
//! retried; a transient store error is retried under the assembly policy.

pub mod secrets;
pub mod settings;

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crds::labels::{DEVICE_WORKLOAD_FINALIZER, MEMBER_OF_LABEL, PODMAN_LABEL_PREFIX};
use crds::{EdgeDevice, EdgeDeviceSet, EdgeWorkload};
use fleet_store::events::{actions, reasons};
use fleet_store::{EventType, FleetStore, object_ref};
use tracing::{debug, info, warn};

use crate::error::{AssemblyError, GatewayError, Result};
use crate::models::{
    DeviceConfiguration, DeviceConfigurationMessage, ImageRegistriesDescriptor, PlaybookExecutionDescriptor,
    WorkloadDescriptor, WorkloadMetricsDescriptor,
};
use crate::retry::{RetryPolicy, retry};
use crate::state::AppState;

/// Secret key holding a registry auth file
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

const DEFAULT_METRICS_PATH: &str = "/metrics";
const DEFAULT_WORKLOAD_METRICS_INTERVAL: i32 = 60;

/// Builds configuration messages against one store
pub struct Assembler<'a> {
    store: &'a dyn FleetStore,
}

impl<'a> Assembler<'a> {
    pub fn new(store: &'a dyn FleetStore) -> Self {
        Self { store }
    }

    /// Configuration message for `device`
    ///
    /// A device under deletion loses its workload finalizer and receives an
    /// empty configuration.
    pub async fn assemble(&self, device: &EdgeDevice) -> std::result::Result<DeviceConfigurationMessage, AssemblyError> {
        let name = device.metadata.name.clone().unwrap_or_default();
        let namespace = device.metadata.namespace.clone().unwrap_or_default();
        let version = device.metadata.resource_version.clone().unwrap_or_default();

        if device.metadata.deletion_timestamp.is_some() {
            self.release_workload_finalizer(device).await?;
            return Ok(DeviceConfigurationMessage {
                device_id: name,
                version,
                ..Default::default()
            });
        }

        let workloads = self.bound_workloads(device, &namespace).await?;
        let set = self.device_set(device, &namespace).await;
        let set = set.as_ref();

        let mut descriptors = Vec::with_capacity(workloads.len());
        let mut secret_uses = BTreeMap::new();
        for workload in &workloads {
            descriptors.push(self.workload_descriptor(workload, &namespace).await?);
            secrets::merge_uses(&mut secret_uses, secrets::secret_uses(&workload.spec.pod));
        }
        let secrets = secrets::resolve_secrets(self.store, &namespace, &secret_uses).await?;

        let configuration = DeviceConfiguration {
            heartbeat: settings::heartbeat(device, set),
            os: settings::os_information(device, set),
            storage: settings::storage(self.store, device, set).await?,
            metrics: Some(settings::metrics(self.store, device, set).await?),
            log_collection: settings::log_collection(self.store, device, set).await?,
            mounts: device
                .spec
                .mounts
                .as_ref()
                .map(|m| m.mounts.clone())
                .unwrap_or_default(),
        };

        Ok(DeviceConfigurationMessage {
            device_id: name.clone(),
            version,
            configuration,
            workloads: descriptors,
            secrets,
            playbook_executions: self.playbook_executions(&namespace, &name).await?,
        })
    }

    /// Drop the workload finalizer of a deleted device, if still present
    pub async fn release_workload_finalizer(&self, device: &EdgeDevice) -> std::result::Result<(), AssemblyError> {
        let finalizers = device.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == DEVICE_WORKLOAD_FINALIZER) {
            return Ok(());
        }
        let remaining: Vec<String> = finalizers
            .into_iter()
            .filter(|f| f != DEVICE_WORKLOAD_FINALIZER)
            .collect();
        self.store.patch_device_finalizers(device, &remaining).await?;
        info!(
            "Released workload finalizer of {}/{}",
            device.metadata.namespace.as_deref().unwrap_or_default(),
            device.metadata.name.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    async fn bound_workloads(&self, device: &EdgeDevice, namespace: &str) -> std::result::Result<Vec<EdgeWorkload>, AssemblyError> {
        let entries = device
            .status
            .as_ref()
            .map(|s| s.workloads.as_slice())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.store.get_workload(namespace, &entry.name).await? {
                Some(w) if w.metadata.deletion_timestamp.is_none() => out.push(w),
                _ => debug!("Skipping workload {}/{}: gone or deleting", namespace, entry.name),
            }
        }
        Ok(out)
    }

    // Best-effort: a set that cannot be read just contributes no defaults
    async fn device_set(&self, device: &EdgeDevice, namespace: &str) -> Option<EdgeDeviceSet> {
        let set_name = device.metadata.labels.as_ref()?.get(MEMBER_OF_LABEL)?;
        match self.store.get_device_set(namespace, set_name).await {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "Failed to read device set {}/{}", namespace, set_name);
                None
            }
        }
    }

    async fn workload_descriptor(
        &self,
        workload: &EdgeWorkload,
        namespace: &str,
    ) -> std::result::Result<WorkloadDescriptor, AssemblyError> {
        let name = workload.metadata.name.clone().unwrap_or_default();
        let spec = &workload.spec;

        let specification = serde_yaml::to_string(&spec.pod)
            .map_err(|e| AssemblyError::Configuration(format!("workload {namespace}/{name}: {e}")))?;

        let labels = workload
            .metadata
            .labels
            .iter()
            .flatten()
            .filter_map(|(k, v)| k.strip_prefix(PODMAN_LABEL_PREFIX).map(|k| (k.to_string(), v.clone())))
            .collect();

        let image_registries = match spec.image_registries.as_ref().and_then(|r| r.secret_ref.as_ref()) {
            Some(reference) => Some(ImageRegistriesDescriptor {
                auth_file: self.registry_auth_file(namespace, &reference.name).await?,
            }),
            None => None,
        };

        let metrics = match &spec.metrics {
            Some(m) => Some(WorkloadMetricsDescriptor {
                path: m.path.clone().unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string()),
                port: m.port,
                interval: m.interval.filter(|i| *i > 0).unwrap_or(DEFAULT_WORKLOAD_METRICS_INTERVAL),
                allow_list: match &m.allow_list {
                    Some(reference) => Some(settings::allow_list(self.store, namespace, reference).await?),
                    None => None,
                },
            }),
            None => None,
        };

        let configmaps =
            secrets::resolve_config_maps(self.store, namespace, &secrets::config_map_uses(&spec.pod)).await?;

        Ok(WorkloadDescriptor {
            name,
            namespace: namespace.to_string(),
            labels,
            specification,
            data: spec.data.clone(),
            image_registries,
            metrics,
            configmaps,
            log_collection: spec.log_collection.clone(),
        })
    }

    async fn registry_auth_file(&self, namespace: &str, secret: &str) -> std::result::Result<String, AssemblyError> {
        let s = self.store.get_secret(namespace, secret).await?.ok_or_else(|| {
            AssemblyError::Configuration(format!("image registry secret {namespace}/{secret} not found"))
        })?;
        let raw = s
            .data
            .as_ref()
            .and_then(|d| d.get(DOCKER_CONFIG_KEY))
            .ok_or_else(|| {
                AssemblyError::Configuration(format!("secret {namespace}/{secret} has no key {DOCKER_CONFIG_KEY}"))
            })?;
        String::from_utf8(raw.0.clone())
            .map_err(|_| AssemblyError::Configuration(format!("secret {namespace}/{secret}: auth file is not UTF-8")))
    }

    async fn playbook_executions(
        &self,
        namespace: &str,
        device: &str,
    ) -> std::result::Result<Vec<PlaybookExecutionDescriptor>, AssemblyError> {
        let executions = self.store.list_playbook_executions(namespace, device).await?;
        Ok(executions
            .into_iter()
            .filter(|e| !e.is_finished())
            .map(|e| PlaybookExecutionDescriptor {
                name: e.metadata.name.unwrap_or_default(),
                playbook: STANDARD.encode(e.spec.playbook.content.as_bytes()),
                timeout_seconds: e.spec.playbook.timeout_seconds,
            })
            .collect())
    }
}

async fn poll_once(state: &AppState, namespace: &str, name: &str) -> Result<DeviceConfigurationMessage> {
    let store = state.store.as_ref();
    let Some(device) = store.get_device(namespace, name).await? else {
        state.metrics.device_not_found.inc();
        return Err(GatewayError::NotFound(format!("device {namespace}/{name}")));
    };

    match Assembler::new(store).assemble(&device).await {
        Ok(message) => Ok(message),
        Err(AssemblyError::Configuration(msg)) => {
            state.metrics.config_errors.inc();
            warn!("Cannot assemble configuration of {}/{}: {}", namespace, name, msg);
            state
                .events
                .publish(
                    &object_ref(&device),
                    EventType::Warning,
                    reasons::CONFIGURATION_FAILED,
                    actions::ASSEMBLE,
                    Some(msg.clone()),
                )
                .await;
            Err(GatewayError::Configuration(msg))
        }
        Err(e) => Err(e.into()),
    }
}

/// Answer a configuration poll from `namespace/name`
pub async fn device_configuration(state: &AppState, namespace: &str, name: &str) -> Result<DeviceConfigurationMessage> {
    retry(
        RetryPolicy::ASSEMBLY,
        |e: &GatewayError| matches!(e, GatewayError::Store(s) if s.is_transient()),
        |_| poll_once(state, namespace, name),
    )
    .await
}
