//! Kubernetes resource watchers.
//!
//! Every watcher goes through the generic `watch_resource()` helper, which
//! runs a kube_runtime::Controller with automatic reconnection and maps
//! reconcile errors to a per-resource Fibonacci backoff.
//!
//! Devices are watched through a predicate on their labels, finalizers and
//! deletion state: heartbeat status patches do not trigger the
//! device-labels reconciler.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crds::{EdgeAutoConfig, EdgeDevice, EdgeDeviceSignedRequest, EdgeWorkload};
use futures::StreamExt;
use kube::Api;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, WatchStreamExt, reflector, watcher};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::reconcile_helpers::resource_key;
use crate::reconciler::Reconciler;

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Key under which a resource's backoff is tracked
fn backoff_key<K: kube::Resource>(kind: &str, obj: &K) -> String {
    format!("{kind}:{}", resource_key(obj))
}

/// Hash of the device fields that can change its bindings
///
/// Labels drive selector matches; finalizers and the deletion timestamp
/// drive teardown. Status is left out.
pub(crate) fn binding_fingerprint(device: &EdgeDevice) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    device.metadata.labels.hash(&mut hasher);
    device.metadata.finalizers.hash(&mut hasher);
    device.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

/// Controller over every change of `K`
fn controller_for<K>(api: Api<K>) -> Controller<K>
where
    K: kube::Resource + Clone + Send + Sync + Debug + DeserializeOwned + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Debug + Unpin,
{
    Controller::new(api, watcher::Config::default())
}

/// Run `controller` for `K` until its stream ends
///
/// `reconcile_fn` returns the action on success; failures are requeued after
/// the resource's next Fibonacci backoff, and a success resets it.
async fn watch_resource<K, F>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    kind: &'static str,
    concurrency: u16,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + Debug + DeserializeOwned + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher (concurrency {})", kind, concurrency);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = backoff_key(kind, obj.as_ref());
        ctx.increment_error(&key);
        let (backoff_seconds, error_count) = ctx.get_backoff_for_resource(&key);
        warn!(
            "Reconciliation of {} failed (attempt {}), retrying in {}s: {}",
            key, error_count, backoff_seconds, error
        );
        Action::requeue(Duration::from_secs(backoff_seconds))
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = backoff_key(kind, obj.as_ref());
            debug!("Reconciling {}", key);
            let action = reconcile_fn(ctx.clone(), obj).await?;
            ctx.reset_error(&key);
            Ok::<_, ControllerError>(action)
        }
    };

    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(concurrency);

    controller
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("Controller error for {}: {}", kind, e);
            }
        })
        .await;

    Ok(())
}

/// Watches EdgeFleet resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    concurrency: u16,
    workload_api: Api<EdgeWorkload>,
    device_api: Api<EdgeDevice>,
    signed_request_api: Api<EdgeDeviceSignedRequest>,
    auto_config_api: Api<EdgeAutoConfig>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        concurrency: u16,
        workload_api: Api<EdgeWorkload>,
        device_api: Api<EdgeDevice>,
        signed_request_api: Api<EdgeDeviceSignedRequest>,
        auto_config_api: Api<EdgeAutoConfig>,
    ) -> Self {
        Self {
            reconciler,
            concurrency,
            workload_api,
            device_api,
            signed_request_api,
            auto_config_api,
        }
    }

    /// Starts watching EdgeWorkload resources.
    pub async fn watch_workloads(&self) -> Result<(), ControllerError> {
        watch_resource(
            controller_for(self.workload_api.clone()),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_workload(&resource).await }),
            "EdgeWorkload",
            self.concurrency,
        )
        .await
    }

    /// Starts watching EdgeDevice resources.
    ///
    /// Only changes to labels, finalizers or the deletion timestamp reach
    /// the reconciler.
    pub async fn watch_devices(&self) -> Result<(), ControllerError> {
        let (reader, writer) = reflector::store();
        let devices = reflector(writer, watcher(self.device_api.clone(), watcher::Config::default()))
            .default_backoff()
            .applied_objects()
            .predicate_filter(binding_fingerprint, Default::default());

        watch_resource(
            Controller::for_stream(devices, reader),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_device(&resource).await }),
            "EdgeDevice",
            self.concurrency,
        )
        .await
    }

    /// Starts watching EdgeDeviceSignedRequest resources.
    pub async fn watch_signed_requests(&self) -> Result<(), ControllerError> {
        watch_resource(
            controller_for(self.signed_request_api.clone()),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_signed_request(&resource).await }),
            "EdgeDeviceSignedRequest",
            self.concurrency,
        )
        .await
    }

    /// Starts watching EdgeAutoConfig resources.
    pub async fn watch_auto_configs(&self) -> Result<(), ControllerError> {
        watch_resource(
            controller_for(self.auto_config_api.clone()),
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_auto_config(&resource).await }),
            "EdgeAutoConfig",
            self.concurrency,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::EdgeDeviceStatus;
    use fleet_store::mock::fixtures::device;
    use futures::stream;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn test_backoff_key() {
        let d = device("edge", "edge-01", &[]);
        assert_eq!(backoff_key("EdgeDevice", &d), "EdgeDevice:edge/edge-01");
    }

    #[test]
    fn test_binding_fingerprint_ignores_status() {
        let d = device("edge", "edge-01", &[("tier", "edge")]);
        let base = binding_fingerprint(&d);

        let mut status_only = d.clone();
        status_only.status = Some(EdgeDeviceStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert_eq!(binding_fingerprint(&status_only), base);

        let relabelled = device("edge", "edge-01", &[("tier", "core")]);
        assert_ne!(binding_fingerprint(&relabelled), base);

        let mut finalized = d.clone();
        finalized.metadata.finalizers = Some(vec!["yggdrasil-workload-finalizer".to_string()]);
        assert_ne!(binding_fingerprint(&finalized), base);

        let mut deleting = d.clone();
        deleting.metadata.deletion_timestamp = Some(Time(jiff::Timestamp::now()));
        assert_ne!(binding_fingerprint(&deleting), base);
    }

    #[tokio::test]
    async fn test_status_only_updates_do_not_trigger() {
        let d = device("edge", "edge-01", &[("tier", "edge")]);
        let mut heartbeat = d.clone();
        heartbeat.status = Some(EdgeDeviceStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        let relabelled = device("edge", "edge-01", &[("tier", "core")]);

        let triggered: Vec<EdgeDevice> = stream::iter(vec![
            Ok::<_, watcher::Error>(d.clone()),
            Ok(heartbeat.clone()),
            Ok(heartbeat),
            Ok(relabelled.clone()),
        ])
        .predicate_filter(binding_fingerprint, Default::default())
        .filter_map(|r| async move { r.ok() })
        .collect()
        .await;

        assert_eq!(triggered.len(), 2);
        assert_eq!(triggered[1].metadata.labels, relabelled.metadata.labels);
    }
}
