//! Kubernetes-backed FleetStore

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use crds::labels::{DEVICE_LABEL, workload_label};
use crds::selector::{IndexKey, is_empty_selector, to_query_string};
use crds::{
    EdgeAutoConfig, EdgeAutoConfigStatus, EdgeDevice, EdgeDeviceSet, EdgeDeviceSignedRequest,
    EdgeDeviceSignedRequestStatus, EdgeDeviceStatus, EdgeWorkload, PlaybookExecution,
};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;
use crate::patch::{ObjectKey, finalizers_patch, labels_patch, status_patch};
use crate::store_trait::{FleetStore, LabelPatch};

/// FleetStore backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Create a store over an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Underlying client, for watchers and event recorders
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let namespace = obj.meta().namespace.clone().ok_or_else(|| {
            StoreError::InvalidRequest("object to create has no namespace".to_string())
        })?;
        Ok(self
            .api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn patch_metadata<K>(&self, obj: &K, body: impl FnOnce(&str) -> Value + Send) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let key = ObjectKey::of(obj)?;
        debug!("Patching metadata of {}", key);
        let body = body(&key.resource_version);
        Ok(self
            .api::<K>(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }

    async fn patch_status<K, S>(&self, obj: &K, status: &S) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
        S: Serialize + Sync,
    {
        let key = ObjectKey::of(obj)?;
        debug!("Patching status of {}", key);
        let body = status_patch(&key.resource_version, status)?;
        Ok(self
            .api::<K>(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }

    async fn list_labeled<K>(&self, namespace: &str, query: &str) -> Result<Vec<K>, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let params = ListParams::default().labels(query);
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }
}

/// Distinct label-selector queries covering `keys`
fn index_queries(keys: &[IndexKey]) -> BTreeSet<String> {
    keys.iter().map(IndexKey::query).collect()
}

#[async_trait::async_trait]
impl FleetStore for KubeStore {
    async fn get_device(&self, namespace: &str, name: &str) -> Result<Option<EdgeDevice>, StoreError> {
        self.get_opt(namespace, name).await
    }

    async fn create_device(&self, device: &EdgeDevice) -> Result<EdgeDevice, StoreError> {
        self.create(device).await
    }

    async fn list_devices(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<EdgeDevice>, StoreError> {
        if is_empty_selector(selector) {
            return Ok(Vec::new());
        }
        let query = to_query_string(selector).map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
        self.list_labeled(namespace, &query).await
    }

    async fn list_devices_by_workload(&self, namespace: &str, workload: &str) -> Result<Vec<EdgeDevice>, StoreError> {
        self.list_labeled(namespace, &workload_label(workload)).await
    }

    async fn patch_device_status(&self, device: &EdgeDevice, status: &EdgeDeviceStatus) -> Result<EdgeDevice, StoreError> {
        self.patch_status(device, status).await
    }

    async fn patch_device_labels(&self, device: &EdgeDevice, labels: &LabelPatch) -> Result<EdgeDevice, StoreError> {
        self.patch_metadata(device, |rv| labels_patch(rv, labels)).await
    }

    async fn patch_device_finalizers(&self, device: &EdgeDevice, finalizers: &[String]) -> Result<EdgeDevice, StoreError> {
        self.patch_metadata(device, |rv| finalizers_patch(rv, finalizers)).await
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<EdgeWorkload>, StoreError> {
        self.get_opt(namespace, name).await
    }

    async fn list_workloads_by_index(&self, namespace: &str, keys: &[IndexKey]) -> Result<Vec<EdgeWorkload>, StoreError> {
        // One server-side label query per key, merged by name
        let mut found = BTreeMap::new();
        for query in index_queries(keys) {
            for workload in self.list_labeled::<EdgeWorkload>(namespace, &query).await? {
                if let Some(name) = workload.metadata.name.clone() {
                    found.entry(name).or_insert(workload);
                }
            }
        }
        Ok(found.into_values().collect())
    }

    async fn create_workload(&self, workload: &EdgeWorkload) -> Result<EdgeWorkload, StoreError> {
        self.create(workload).await
    }

    async fn patch_workload_labels(&self, workload: &EdgeWorkload, labels: &LabelPatch) -> Result<EdgeWorkload, StoreError> {
        self.patch_metadata(workload, |rv| labels_patch(rv, labels)).await
    }

    async fn patch_workload_finalizers(&self, workload: &EdgeWorkload, finalizers: &[String]) -> Result<EdgeWorkload, StoreError> {
        self.patch_metadata(workload, |rv| finalizers_patch(rv, finalizers)).await
    }

    async fn get_signed_request(&self, namespace: &str, name: &str) -> Result<Option<EdgeDeviceSignedRequest>, StoreError> {
        self.get_opt(namespace, name).await
    }

    async fn create_signed_request(&self, request: &EdgeDeviceSignedRequest) -> Result<EdgeDeviceSignedRequest, StoreError> {
        self.create(request).await
    }

    async fn patch_signed_request_status(&self, request: &EdgeDeviceSignedRequest, status: &EdgeDeviceSignedRequestStatus) -> Result<EdgeDeviceSignedRequest, StoreError> {
        self.patch_status(request, status).await
    }

    async fn get_device_set(&self, namespace: &str, name: &str) -> Result<Option<EdgeDeviceSet>, StoreError> {
        self.get_opt(namespace, name).await
    }

    async fn patch_auto_config_status(&self, config: &EdgeAutoConfig, status: &EdgeAutoConfigStatus) -> Result<EdgeAutoConfig, StoreError> {
        self.patch_status(config, status).await
    }

    async fn list_playbook_executions(&self, namespace: &str, device: &str) -> Result<Vec<PlaybookExecution>, StoreError> {
        self.list_labeled(namespace, &format!("{DEVICE_LABEL}={device}")).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        self.get_opt(namespace, name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.create(secret).await
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StoreError> {
        self.list_labeled(namespace, label_selector).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError> {
        self.get_opt(namespace, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::selector::device_lookup_keys;

    #[test]
    fn test_device_lookup_becomes_label_queries() {
        let labels: BTreeMap<String, String> = [
            ("tier".to_string(), "edge".to_string()),
            ("kubernetes.io/arch".to_string(), "arm64".to_string()),
        ]
        .into_iter()
        .collect();

        let queries: Vec<String> = index_queries(&device_lookup_keys("edge-01", &labels)).into_iter().collect();
        assert_eq!(
            queries,
            vec![
                "selector/devicename=edge-01",
                "selector/doesnotexist",
                "selector/kubernetes.io.arch",
                "selector/tier",
            ]
        );
    }

    #[test]
    fn test_duplicate_keys_query_once() {
        let keys = vec![IndexKey::Label("tier".into()), IndexKey::Label("tier".into())];
        assert_eq!(index_queries(&keys).len(), 1);
    }
}
