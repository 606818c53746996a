//! EdgeDeviceSignedRequest approval
//!
//! Once a request is approved the device it describes is created in the
//! target namespace, carrying the bootstrap marker, optional set membership
//! and both device finalizers. The request is then marked `Approved`.

use chrono::Utc;
use crds::labels::{DEVICE_CONNECTION_FINALIZER, DEVICE_WORKLOAD_FINALIZER, bootstrap_device_labels};
use crds::{
    EdgeDevice, EdgeDeviceSignedRequest, EdgeDeviceSpec, EdgeDeviceStatus, SignedRequestCondition,
    SignedRequestConditionType,
};
use fleet_store::events::{actions, reasons};
use fleet_store::{EventType, StoreError, object_ref};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::controller::Action;
use tracing::{debug, info};

use super::Reconciler;
use crate::error::ControllerError;

/// Namespace the approved device lives in
pub fn target_namespace(request: &EdgeDeviceSignedRequest) -> &str {
    match request.spec.target_namespace.as_str() {
        "" => request.metadata.namespace.as_deref().unwrap_or_default(),
        ns => ns,
    }
}

fn approved_device(request: &EdgeDeviceSignedRequest, namespace: &str) -> EdgeDevice {
    EdgeDevice {
        metadata: ObjectMeta {
            name: request.metadata.name.clone(),
            namespace: Some(namespace.to_string()),
            labels: Some(bootstrap_device_labels(request.spec.target_set.as_deref())),
            finalizers: Some(vec![
                DEVICE_CONNECTION_FINALIZER.to_string(),
                DEVICE_WORKLOAD_FINALIZER.to_string(),
            ]),
            ..Default::default()
        },
        spec: EdgeDeviceSpec {
            request_time: Some(Utc::now()),
            ..Default::default()
        },
        status: None,
    }
}

impl Reconciler {
    /// Reconcile one EdgeDeviceSignedRequest
    pub async fn reconcile_signed_request(&self, request: &EdgeDeviceSignedRequest) -> Result<Action, ControllerError> {
        let name = request.metadata.name.as_deref().unwrap_or_default();
        let namespace = request.metadata.namespace.as_deref().unwrap_or_default();

        if !request.spec.approved {
            debug!("Signed request {}/{} is not approved yet", namespace, name);
            return Ok(Action::await_change());
        }

        let target = target_namespace(request);
        let device = match self.store.get_device(target, name).await? {
            Some(device) => device,
            None => match self.store.create_device(&approved_device(request, target)).await {
                Ok(device) => {
                    info!("Created device {}/{} from signed request {}/{}", target, name, namespace, name);
                    device
                }
                Err(StoreError::AlreadyExists(_)) => {
                    // Lost a race with another writer; pick it up on the next event
                    return Ok(Action::await_change());
                }
                Err(e) => return Err(e.into()),
            },
        };

        let hardware = request.spec.features.as_ref().and_then(|f| f.hardware.clone());
        if let Some(hardware) = hardware {
            let status = device.status.clone().unwrap_or_default();
            if status.hardware.is_none() {
                let status = EdgeDeviceStatus {
                    hardware: Some(hardware),
                    ..status
                };
                self.store.patch_device_status(&device, &status).await?;
            }
        }

        let mut status = request.status.clone().unwrap_or_default();
        if !status.has_condition(SignedRequestConditionType::Approved) {
            status.set_condition(SignedRequestCondition::new(
                SignedRequestConditionType::Approved,
                "Device created",
            ));
            self.store.patch_signed_request_status(request, &status).await?;
            info!("Approved signed request {}/{}", namespace, name);
            self.events
                .publish(
                    &object_ref(request),
                    EventType::Normal,
                    reasons::APPROVED,
                    actions::RECONCILE,
                    Some(format!("device {target}/{name} created")),
                )
                .await;
        }

        Ok(Action::await_change())
    }
}

#[cfg(test)]
#[path = "signed_request_test.rs"]
mod signed_request_test;
