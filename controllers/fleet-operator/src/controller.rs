//! Main controller implementation.
//!
//! The `Controller` struct spawns one watcher per reconciled CRD:
//! - EdgeWorkload: selector projection and forward/reverse binding
//! - EdgeDevice: device-label rebinding and device teardown
//! - EdgeDeviceSignedRequest: approval into EdgeDevices
//! - EdgeAutoConfig: per-device workloads from templates

use std::sync::Arc;

use crds::{EdgeAutoConfig, EdgeDevice, EdgeDeviceSignedRequest, EdgeWorkload};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Owns the watcher tasks of the operator.
pub struct Controller {
    workload_watcher: JoinHandle<Result<(), ControllerError>>,
    device_watcher: JoinHandle<Result<(), ControllerError>>,
    signed_request_watcher: JoinHandle<Result<(), ControllerError>>,
    auto_config_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Spawn every watcher
    ///
    /// `namespace` restricts the watches; `None` watches all namespaces.
    pub fn start(
        client: Client,
        reconciler: Arc<Reconciler>,
        namespace: Option<&str>,
        concurrency: u16,
    ) -> Self {
        info!("Watching {}", namespace.unwrap_or("all namespaces"));

        let watcher = Arc::new(Watcher::new(
            reconciler,
            concurrency,
            api::<EdgeWorkload>(&client, namespace),
            api::<EdgeDevice>(&client, namespace),
            api::<EdgeDeviceSignedRequest>(&client, namespace),
            api::<EdgeAutoConfig>(&client, namespace),
        ));

        let w = watcher.clone();
        let workload_watcher = tokio::spawn(async move { w.watch_workloads().await });
        let w = watcher.clone();
        let device_watcher = tokio::spawn(async move { w.watch_devices().await });
        let w = watcher.clone();
        let signed_request_watcher = tokio::spawn(async move { w.watch_signed_requests().await });
        let w = watcher;
        let auto_config_watcher = tokio::spawn(async move { w.watch_auto_configs().await });

        Self {
            workload_watcher,
            device_watcher,
            signed_request_watcher,
            auto_config_watcher,
        }
    }

    /// Wait until any watcher stops; a stopped watcher is an error
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("EdgeFleet controllers running");

        let (kind, result) = tokio::select! {
            result = &mut self.workload_watcher => ("EdgeWorkload", result),
            result = &mut self.device_watcher => ("EdgeDevice", result),
            result = &mut self.signed_request_watcher => ("EdgeDeviceSignedRequest", result),
            result = &mut self.auto_config_watcher => ("EdgeAutoConfig", result),
        };

        result
            .map_err(|e| ControllerError::Watch(format!("{kind} watcher panicked: {e}")))?
            .map_err(|e| ControllerError::Watch(format!("{kind} watcher error: {e}")))?;
        Err(ControllerError::Watch(format!("{kind} watcher stopped")))
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.workload_watcher.abort();
        self.device_watcher.abort();
        self.signed_request_watcher.abort();
        self.auto_config_watcher.abort();
    }
}
