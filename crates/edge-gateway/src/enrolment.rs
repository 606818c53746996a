//! Enrolment state machine, gateway side
//!
//! `Unknown -> SignedRequestPending -> SignedRequestApproved -> DeviceCreated
//! -> Registered -> Active`. The gateway drives the first transition
//! (enrolment) and the registration; approval and device creation belong
//! to the operator.

use axum::http::StatusCode;
use crds::labels::{SIGNED_REQUEST_LABEL, hardware_labels};
use crds::{
    EdgeDevice, EdgeDeviceSignedRequest, EdgeDeviceSignedRequestSpec,
    EdgeDeviceSignedRequestStatus, SignedRequestFeatures,
};
use fleet_store::events::{actions, reasons};
use fleet_store::{EventType, LabelPatch, StoreError, object_ref};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::auth::{AuthClass, AuthContext, authenticate};
use crate::error::{GatewayError, Result};
use crate::models::{EnrolmentInfo, RegistrationInfo, RegistrationResponse};
use crate::retry::{RetryPolicy, retry};
use crate::state::AppState;
use crate::tls::ClientCertChain;

/// Result of an `enrolment` directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrolmentOutcome {
    /// Signed request created
    Created,
    /// Signed request exists, device not created yet
    Pending,
    /// Signed request exists and the device is in its target namespace
    AlreadyReported,
}

impl EnrolmentOutcome {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Created => StatusCode::CREATED,
            Self::Pending => StatusCode::OK,
            Self::AlreadyReported => StatusCode::ALREADY_REPORTED,
        }
    }
}

fn has_bootstrap_marker(device: &EdgeDevice) -> bool {
    device
        .metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(SIGNED_REQUEST_LABEL))
}

fn not_found(what: &str, namespace: &str, name: &str) -> GatewayError {
    GatewayError::NotFound(format!("{what} {namespace}/{name}"))
}

/// Handle an `enrolment` directive
pub async fn enrol(state: &AppState, device_id: &str, info: EnrolmentInfo) -> Result<EnrolmentOutcome> {
    let initial = state.config.initial_namespace.as_str();

    if let Some(existing) = state.store.get_signed_request(initial, device_id).await? {
        let target = existing.spec.target_namespace.as_str();
        if state.store.get_device(target, device_id).await?.is_some() {
            debug!("Device {}/{} already enrolled", target, device_id);
            return Ok(EnrolmentOutcome::AlreadyReported);
        }
        return Ok(EnrolmentOutcome::Pending);
    }

    let target_namespace = info
        .target_namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| initial.to_string());
    let request = EdgeDeviceSignedRequest {
        metadata: ObjectMeta {
            name: Some(device_id.to_string()),
            namespace: Some(initial.to_string()),
            ..Default::default()
        },
        spec: EdgeDeviceSignedRequestSpec {
            target_namespace,
            target_set: None,
            approved: state.config.auto_approval,
            features: info.features.map(|f| SignedRequestFeatures {
                hardware: f.hardware,
                model_name: f.model_name,
            }),
        },
        status: None,
    };

    let created = match state.store.create_signed_request(&request).await {
        Ok(created) => created,
        // Concurrent enrolment of the same device
        Err(StoreError::AlreadyExists(_)) => return Ok(EnrolmentOutcome::Pending),
        Err(e) => return Err(e.into()),
    };
    state
        .store
        .patch_signed_request_status(&created, &EdgeDeviceSignedRequestStatus::pending())
        .await?;

    state.metrics.enrolments.inc();
    info!(
        approved = state.config.auto_approval,
        "Created signed request {}/{}", initial, device_id
    );
    Ok(EnrolmentOutcome::Created)
}

/// Handle a `registration` directive
///
/// Missing signed requests or devices are an expected pending state and do
/// not count as failed registrations.
pub async fn register(
    state: &AppState,
    auth: &AuthContext,
    chain: &ClientCertChain,
    device_id: &str,
    info: RegistrationInfo,
) -> Result<RegistrationResponse> {
    let result = register_device(state, auth, chain, device_id, &info).await;
    match &result {
        Ok(_) | Err(GatewayError::NotFound(_)) => {}
        Err(e) => {
            state.metrics.registration_failures.inc();
            warn!(device = device_id, error = %e, "Registration failed");
        }
    }
    result
}

async fn register_device(
    state: &AppState,
    auth: &AuthContext,
    chain: &ClientCertChain,
    device_id: &str,
    info: &RegistrationInfo,
) -> Result<RegistrationResponse> {
    let initial = state.config.initial_namespace.as_str();

    let namespace = if auth.is_bootstrap() {
        state
            .store
            .get_signed_request(initial, device_id)
            .await?
            .ok_or_else(|| not_found("signed request", initial, device_id))?
            .spec
            .target_namespace
    } else {
        // Certificate renewal: the device identity must pass full verification
        let roots = state.ca.trust_roots().await?;
        let device_auth = authenticate(Some(chain), AuthClass::Device, &roots, initial, &state.metrics)?;
        device_auth.ensure_owner(device_id, &state.metrics)?;
        device_auth.namespace
    };

    let device = state
        .store
        .get_device(&namespace, device_id)
        .await?
        .ok_or_else(|| not_found("device", &namespace, device_id))?;
    if auth.is_bootstrap() && !has_bootstrap_marker(&device) {
        return Err(GatewayError::Forbidden(format!(
            "device {namespace}/{device_id} is already registered; use the device certificate"
        )));
    }

    let certificate = state
        .ca
        .sign_csr(
            &info.certificate_request,
            device_id,
            &namespace,
            state.config.client_cert_expiration_days,
        )
        .await?;

    let store = state.store.as_ref();
    let ns = namespace.as_str();
    let hardware = info.hardware.as_ref();
    let registered = retry(
        RetryPolicy::REGISTRATION,
        |e: &GatewayError| matches!(e, GatewayError::Store(s) if s.is_transient()),
        |_| async move {
            let device = store
                .get_device(ns, device_id)
                .await?
                .ok_or_else(|| not_found("device", ns, device_id))?;

            let labels = device.metadata.labels.clone().unwrap_or_default();
            let mut patch = LabelPatch::new();
            if labels.contains_key(SIGNED_REQUEST_LABEL) {
                patch.insert(SIGNED_REQUEST_LABEL.to_string(), None);
            }
            if let Some(hw) = hardware {
                for (key, value) in hardware_labels(hw) {
                    if labels.get(&key) != Some(&value) {
                        patch.insert(key, Some(value));
                    }
                }
            }
            let device = if patch.is_empty() {
                device
            } else {
                store.patch_device_labels(&device, &patch).await?
            };

            if let Some(hw) = hardware {
                let mut status = device.status.clone().unwrap_or_default();
                if status.hardware.as_ref() != Some(hw) {
                    status.hardware = Some(hw.clone());
                    return Ok(store.patch_device_status(&device, &status).await?);
                }
            }
            Ok::<_, GatewayError>(device)
        },
    )
    .await?;

    state
        .events
        .publish(
            &object_ref(&registered),
            EventType::Normal,
            reasons::REGISTERED,
            actions::REGISTER,
            Some(format!("Issued device certificate valid for {} days", state.config.client_cert_expiration_days.max(1))),
        )
        .await;
    info!("Registered device {}/{}", namespace, device_id);

    Ok(RegistrationResponse { certificate })
}

#[cfg(test)]
#[path = "enrolment_test.rs"]
mod enrolment_test;
