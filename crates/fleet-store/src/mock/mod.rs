//! Mock FleetStore for unit testing
//!
//! Keeps every object in memory with the same contract as the API server
//! where the core depends on it:
//! - every write bumps `resourceVersion`, and patches against a stale
//!   pre-image fail with [`StoreError::Conflict`]
//! - deleting an object with finalizers only sets its deletion timestamp;
//!   it disappears once the last finalizer is patched away
//! - failures can be injected to exercise retry paths
//!
//! Fixture builders live in [`fixtures`].

pub mod fixtures;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crds::labels::{DEVICE_LABEL, workload_label};
use crds::selector::{IndexKey, selector_matches, workload_index_keys};
use crds::{
    EdgeAutoConfig, EdgeAutoConfigStatus, EdgeDevice, EdgeDeviceSet, EdgeDeviceSignedRequest,
    EdgeDeviceSignedRequestStatus, EdgeDeviceStatus, EdgeWorkload, PlaybookExecution,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::Resource;

use crate::error::StoreError;
use crate::patch::{ObjectKey, apply_label_patch};
use crate::store_trait::{FleetStore, LabelPatch};

type Key = (String, String);
type Table<K> = BTreeMap<Key, K>;

#[derive(Default)]
struct MockState {
    next_rv: u64,
    failures: usize,
    status_patches: usize,
    label_patches: usize,
    devices: Table<EdgeDevice>,
    workloads: Table<EdgeWorkload>,
    signed_requests: Table<EdgeDeviceSignedRequest>,
    device_sets: Table<EdgeDeviceSet>,
    auto_configs: Table<EdgeAutoConfig>,
    playbook_executions: Table<PlaybookExecution>,
    secrets: Table<Secret>,
    config_maps: Table<ConfigMap>,
}

impl MockState {
    fn check_fault(&mut self) -> Result<(), StoreError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

/// Mock FleetStore for testing
#[derive(Clone, Default)]
pub struct MockFleetStore {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockFleetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFleetStore").finish_non_exhaustive()
    }
}

fn key_of<K: Resource>(obj: &K) -> Result<Key, StoreError> {
    let meta = obj.meta();
    match (&meta.namespace, &meta.name) {
        (Some(ns), Some(name)) => Ok((ns.clone(), name.clone())),
        _ => Err(StoreError::InvalidRequest(
            "object needs a namespace and a name".to_string(),
        )),
    }
}

fn next_rv(counter: &mut u64) -> String {
    *counter += 1;
    counter.to_string()
}

fn store<K: Resource + Clone>(table: &mut Table<K>, counter: &mut u64, mut obj: K) -> Result<K, StoreError> {
    let key = key_of(&obj)?;
    let meta = obj.meta_mut();
    meta.resource_version = Some(next_rv(counter));
    if meta.uid.is_none() {
        meta.uid = Some(format!("{}-{}-uid", key.0, key.1));
    }
    table.insert(key, obj.clone());
    Ok(obj)
}

fn create<K: Resource + Clone>(table: &mut Table<K>, counter: &mut u64, obj: &K) -> Result<K, StoreError> {
    let key = key_of(obj)?;
    if table.contains_key(&key) {
        return Err(StoreError::AlreadyExists(format!("{}/{}", key.0, key.1)));
    }
    store(table, counter, obj.clone())
}

fn update<K: Resource + Clone>(
    table: &mut Table<K>,
    counter: &mut u64,
    pre: &K,
    apply: impl FnOnce(&mut K),
) -> Result<K, StoreError> {
    let key = ObjectKey::of(pre)?;
    let table_key = (key.namespace.clone(), key.name.clone());
    let current = table
        .get_mut(&table_key)
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
    if current.meta().resource_version.as_deref() != Some(key.resource_version.as_str()) {
        return Err(StoreError::Conflict(format!(
            "{key}: resourceVersion {} is stale",
            key.resource_version
        )));
    }

    apply(current);
    current.meta_mut().resource_version = Some(next_rv(counter));
    let updated = current.clone();

    let meta = updated.meta();
    if meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().is_none_or(Vec::is_empty) {
        table.remove(&table_key);
    }
    Ok(updated)
}

fn delete<K: Resource + Clone>(table: &mut Table<K>, counter: &mut u64, namespace: &str, name: &str) -> bool {
    let key = (namespace.to_string(), name.to_string());
    let Some(obj) = table.get_mut(&key) else {
        return false;
    };
    if obj.meta().finalizers.as_ref().is_none_or(Vec::is_empty) {
        table.remove(&key);
    } else {
        let meta = obj.meta_mut();
        meta.deletion_timestamp = Some(Time(jiff::Timestamp::now()));
        meta.resource_version = Some(next_rv(counter));
    }
    true
}

fn get<K: Clone>(table: &Table<K>, namespace: &str, name: &str) -> Option<K> {
    table.get(&(namespace.to_string(), name.to_string())).cloned()
}

fn in_namespace<'a, K>(table: &'a Table<K>, namespace: &'a str) -> impl Iterator<Item = &'a K> + 'a {
    table
        .iter()
        .filter(move |((ns, _), _)| ns == namespace)
        .map(|(_, v)| v)
}

fn labels_of<K: Resource>(obj: &K) -> BTreeMap<String, String> {
    obj.meta().labels.clone().unwrap_or_default()
}

/// Evaluate a `labelSelector` query string (`k=v` and `k` terms only)
fn matches_query(labels: &BTreeMap<String, String>, query: &str) -> bool {
    query
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term),
        })
}

impl MockFleetStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` store calls with [`StoreError::Unavailable`]
    pub fn inject_failures(&self, n: usize) {
        self.state().failures = n;
    }

    /// Number of status subresource patches applied so far
    pub fn status_patch_count(&self) -> usize {
        self.state().status_patches
    }

    /// Number of label patches applied so far
    pub fn label_patch_count(&self) -> usize {
        self.state().label_patches
    }

    /// Insert or replace a device (for test setup)
    pub fn put_device(&self, device: EdgeDevice) -> EdgeDevice {
        let mut s = self.state();
        let MockState { devices, next_rv, .. } = &mut *s;
        store(devices, next_rv, device).unwrap_or_else(|e| panic!("invalid fixture: {e}"))
    }

    /// Insert or replace a workload (for test setup)
    pub fn put_workload(&self, workload: EdgeWorkload) -> EdgeWorkload {
        let mut s = self.state();
        let MockState { workloads, next_rv, .. } = &mut *s;
        store(workloads, next_rv, workload).unwrap_or_else(|e| panic!("invalid fixture: {e}"))
    }

    /// Insert or replace a signed request (for test setup)
    pub fn put_signed_request(&self, request: EdgeDeviceSignedRequest) -> EdgeDeviceSignedRequest {
        let mut s = self.state();
        let MockState { signed_requests, next_rv, .. } = &mut *s;
        store(signed_requests, next_rv, request).unwrap_or_else(|e| panic!("invalid fixture: {e}"))
    }

    /// Insert or replace a device set (for test setup)
    pub fn put_device_set(&self, set: EdgeDeviceSet) -> EdgeDeviceSet {
        let mut s = self.state();
        let MockState { device_sets, next_rv, .. } = &mut *s;
        store(device_sets, next_rv, set).unwrap_or_else(|e| panic!("invalid fixture: {e}"))
    }

    /// Insert or replace an auto-config (for test setup)
    pub fn put_auto_config(&self, config: EdgeAutoConfig) -> EdgeAutoConfig {
        let mut s = self.state();
        let MockState { auto_configs, next_rv, .. } = &mut *s;
        store(auto_configs, next_rv, config).unwrap_or_else(|e| panic!("invalid fixture: {e}"))
    }

    /// Insert or replace a playbook execution (for test setup)
    pub fn put_playbook_execution(&self, execution: PlaybookExecution) -> PlaybookExecution {
        let mut s = self.state();
        let MockState { playbook_executions, next_rv, .. } = &mut *s;
        store(playbook_executions, next_rv, execution).unwrap_or_else(|e| panic!("invalid fixture: {e}"))
    }

    /// Insert or replace a secret (for test setup)
    pub fn put_secret(&self, secret: Secret) -> Secret {
        let mut s = self.state();
        let MockState { secrets, next_rv, .. } = &mut *s;
        store(secrets, next_rv, secret).unwrap_or_else(|e| panic!("invalid fixture: {e}"))
    }

    /// Insert or replace a config map (for test setup)
    pub fn put_config_map(&self, config_map: ConfigMap) -> ConfigMap {
        let mut s = self.state();
        let MockState { config_maps, next_rv, .. } = &mut *s;
        store(config_maps, next_rv, config_map).unwrap_or_else(|e| panic!("invalid fixture: {e}"))
    }

    /// Delete a device, honouring finalizers. Returns false if absent.
    pub fn delete_device(&self, namespace: &str, name: &str) -> bool {
        let mut s = self.state();
        let MockState { devices, next_rv, .. } = &mut *s;
        delete(devices, next_rv, namespace, name)
    }

    /// Delete a workload, honouring finalizers. Returns false if absent.
    pub fn delete_workload(&self, namespace: &str, name: &str) -> bool {
        let mut s = self.state();
        let MockState { workloads, next_rv, .. } = &mut *s;
        delete(workloads, next_rv, namespace, name)
    }

    /// Every device in a namespace
    pub fn devices(&self, namespace: &str) -> Vec<EdgeDevice> {
        in_namespace(&self.state().devices, namespace).cloned().collect()
    }

    /// Current state of an auto-config
    pub fn auto_config(&self, namespace: &str, name: &str) -> Option<EdgeAutoConfig> {
        get(&self.state().auto_configs, namespace, name)
    }

    /// Every secret in a namespace
    pub fn secrets(&self, namespace: &str) -> Vec<Secret> {
        in_namespace(&self.state().secrets, namespace).cloned().collect()
    }
}

#[async_trait::async_trait]
impl FleetStore for MockFleetStore {
    async fn get_device(&self, namespace: &str, name: &str) -> Result<Option<EdgeDevice>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(get(&s.devices, namespace, name))
    }

    async fn create_device(&self, device: &EdgeDevice) -> Result<EdgeDevice, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        let MockState { devices, next_rv, .. } = &mut *s;
        create(devices, next_rv, device)
    }

    async fn list_devices(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<EdgeDevice>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        let mut out = Vec::new();
        for device in in_namespace(&s.devices, namespace) {
            let matched = selector_matches(selector, &labels_of(device))
                .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
            if matched {
                out.push(device.clone());
            }
        }
        Ok(out)
    }

    async fn list_devices_by_workload(&self, namespace: &str, workload: &str) -> Result<Vec<EdgeDevice>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        let label = workload_label(workload);
        Ok(in_namespace(&s.devices, namespace)
            .filter(|d| labels_of(*d).contains_key(&label))
            .cloned()
            .collect())
    }

    async fn patch_device_status(&self, device: &EdgeDevice, status: &EdgeDeviceStatus) -> Result<EdgeDevice, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        s.status_patches += 1;
        let MockState { devices, next_rv, .. } = &mut *s;
        update(devices, next_rv, device, |d| d.status = Some(status.clone()))
    }

    async fn patch_device_labels(&self, device: &EdgeDevice, labels: &LabelPatch) -> Result<EdgeDevice, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        s.label_patches += 1;
        let MockState { devices, next_rv, .. } = &mut *s;
        update(devices, next_rv, device, |d| {
            apply_label_patch(d.metadata.labels.get_or_insert_with(BTreeMap::new), labels);
        })
    }

    async fn patch_device_finalizers(&self, device: &EdgeDevice, finalizers: &[String]) -> Result<EdgeDevice, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        let MockState { devices, next_rv, .. } = &mut *s;
        update(devices, next_rv, device, |d| d.metadata.finalizers = Some(finalizers.to_vec()))
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<EdgeWorkload>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(get(&s.workloads, namespace, name))
    }

    async fn list_workloads_by_index(&self, namespace: &str, keys: &[IndexKey]) -> Result<Vec<EdgeWorkload>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(in_namespace(&s.workloads, namespace)
            .filter(|w| workload_index_keys(&labels_of(*w)).iter().any(|k| keys.contains(k)))
            .cloned()
            .collect())
    }

    async fn create_workload(&self, workload: &EdgeWorkload) -> Result<EdgeWorkload, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        let MockState { workloads, next_rv, .. } = &mut *s;
        create(workloads, next_rv, workload)
    }

    async fn patch_workload_labels(&self, workload: &EdgeWorkload, labels: &LabelPatch) -> Result<EdgeWorkload, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        s.label_patches += 1;
        let MockState { workloads, next_rv, .. } = &mut *s;
        update(workloads, next_rv, workload, |w| {
            apply_label_patch(w.metadata.labels.get_or_insert_with(BTreeMap::new), labels);
        })
    }

    async fn patch_workload_finalizers(&self, workload: &EdgeWorkload, finalizers: &[String]) -> Result<EdgeWorkload, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        let MockState { workloads, next_rv, .. } = &mut *s;
        update(workloads, next_rv, workload, |w| w.metadata.finalizers = Some(finalizers.to_vec()))
    }

    async fn get_signed_request(&self, namespace: &str, name: &str) -> Result<Option<EdgeDeviceSignedRequest>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(get(&s.signed_requests, namespace, name))
    }

    async fn create_signed_request(&self, request: &EdgeDeviceSignedRequest) -> Result<EdgeDeviceSignedRequest, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        let MockState { signed_requests, next_rv, .. } = &mut *s;
        create(signed_requests, next_rv, request)
    }

    async fn patch_signed_request_status(&self, request: &EdgeDeviceSignedRequest, status: &EdgeDeviceSignedRequestStatus) -> Result<EdgeDeviceSignedRequest, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        s.status_patches += 1;
        let MockState { signed_requests, next_rv, .. } = &mut *s;
        update(signed_requests, next_rv, request, |r| r.status = Some(status.clone()))
    }

    async fn get_device_set(&self, namespace: &str, name: &str) -> Result<Option<EdgeDeviceSet>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(get(&s.device_sets, namespace, name))
    }

    async fn patch_auto_config_status(&self, config: &EdgeAutoConfig, status: &EdgeAutoConfigStatus) -> Result<EdgeAutoConfig, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        s.status_patches += 1;
        let MockState { auto_configs, next_rv, .. } = &mut *s;
        update(auto_configs, next_rv, config, |c| c.status = Some(status.clone()))
    }

    async fn list_playbook_executions(&self, namespace: &str, device: &str) -> Result<Vec<PlaybookExecution>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(in_namespace(&s.playbook_executions, namespace)
            .filter(|p| labels_of(*p).get(DEVICE_LABEL).map(String::as_str) == Some(device))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(get(&s.secrets, namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        let MockState { secrets, next_rv, .. } = &mut *s;
        create(secrets, next_rv, secret)
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(in_namespace(&s.secrets, namespace)
            .filter(|sec| matches_query(&labels_of(*sec), label_selector))
            .cloned()
            .collect())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError> {
        let mut s = self.state();
        s.check_fault()?;
        Ok(get(&s.config_maps, namespace, name))
    }
}
