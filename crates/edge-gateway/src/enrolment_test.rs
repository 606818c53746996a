use axum::http::StatusCode;
use crds::edge_device::{Cpu, Hardware};
use crds::labels::{SIGNED_REQUEST_LABEL, bootstrap_device_labels};
use fleet_pki::{CertificateRequest, PeerCertificate};
use fleet_store::FleetStore;
use fleet_store::mock::fixtures::{device, signed_request};

use super::*;
use crate::models::EnrolmentFeatures;
use crate::state::GatewayConfig;
use crate::test_support::{TestGateway, gateway, gateway_with};

fn hardware() -> Hardware {
    Hardware {
        hostname: Some("Edge-01".into()),
        cpu: Some(Cpu {
            architecture: Some("aarch64".into()),
            model_name: None,
        }),
        ..Default::default()
    }
}

fn registration(name: &str, hardware: Option<Hardware>) -> RegistrationInfo {
    let request = CertificateRequest::new(name).unwrap();
    RegistrationInfo {
        certificate_request: request.csr_pem().to_string(),
        hardware,
    }
}

/// Approved device waiting for its first registration in `edge`
fn approved_device(gw: &TestGateway, name: &str) {
    gw.store.put_signed_request(signed_request("edgefleet", name, "edge", true));
    let mut d = device("edge", name, &[]);
    d.metadata.labels = Some(bootstrap_device_labels(None));
    gw.store.put_device(d);
}

#[tokio::test]
async fn test_enrol_creates_pending_request() {
    let gw = gateway();
    let info = EnrolmentInfo {
        features: Some(EnrolmentFeatures {
            hardware: Some(hardware()),
            model_name: Some("rpi4".into()),
        }),
        target_namespace: Some("edge".into()),
    };

    let outcome = enrol(&gw.state, "edge-01", info).await.unwrap();
    assert_eq!(outcome, EnrolmentOutcome::Created);
    assert_eq!(outcome.status(), StatusCode::CREATED);

    let sr = gw.store.get_signed_request("edgefleet", "edge-01").await.unwrap().unwrap();
    assert_eq!(sr.spec.target_namespace, "edge");
    assert!(!sr.spec.approved);
    assert_eq!(sr.spec.features.unwrap().model_name.as_deref(), Some("rpi4"));
    assert!(sr.status.unwrap().has_condition(crds::SignedRequestConditionType::Pending));
    assert_eq!(gw.state.metrics.enrolments.get(), 1);
}

#[tokio::test]
async fn test_enrol_defaults_to_initial_namespace() {
    let gw = gateway();
    let info = EnrolmentInfo {
        features: None,
        target_namespace: Some(String::new()),
    };
    enrol(&gw.state, "edge-01", info).await.unwrap();

    let sr = gw.store.get_signed_request("edgefleet", "edge-01").await.unwrap().unwrap();
    assert_eq!(sr.spec.target_namespace, "edgefleet");
}

#[tokio::test]
async fn test_enrol_repeated_until_device_exists() {
    let gw = gateway();
    let info = || EnrolmentInfo {
        features: None,
        target_namespace: Some("edge".into()),
    };

    assert_eq!(enrol(&gw.state, "edge-01", info()).await.unwrap(), EnrolmentOutcome::Created);
    assert_eq!(enrol(&gw.state, "edge-01", info()).await.unwrap(), EnrolmentOutcome::Pending);

    gw.store.put_device(device("edge", "edge-01", &[]));
    let outcome = enrol(&gw.state, "edge-01", info()).await.unwrap();
    assert_eq!(outcome, EnrolmentOutcome::AlreadyReported);
    assert_eq!(outcome.status(), StatusCode::ALREADY_REPORTED);
    assert_eq!(gw.state.metrics.enrolments.get(), 1);
}

#[tokio::test]
async fn test_enrol_with_auto_approval() {
    let gw = gateway_with(GatewayConfig {
        auto_approval: true,
        ..Default::default()
    });
    let info = EnrolmentInfo {
        features: None,
        target_namespace: None,
    };
    enrol(&gw.state, "edge-01", info).await.unwrap();

    let sr = gw.store.get_signed_request("edgefleet", "edge-01").await.unwrap().unwrap();
    assert!(sr.spec.approved);
}

#[tokio::test]
async fn test_register_with_bootstrap_certificate() {
    let gw = gateway();
    approved_device(&gw, "edge-01");
    let chain = gw.bootstrap_chain().await;
    let auth = gw.auth(&chain, AuthClass::Register).await;

    let response = register(&gw.state, &auth, &chain, "edge-01", registration("edge-01", Some(hardware())))
        .await
        .unwrap();

    let cert = PeerCertificate::from_pem(&response.certificate).unwrap();
    assert_eq!(cert.common_name(), "edge-01");
    assert_eq!(cert.org_unit().as_deref(), Some("edge"));

    let d = gw.store.get_device("edge", "edge-01").await.unwrap().unwrap();
    let labels = d.metadata.labels.unwrap();
    assert!(!labels.contains_key(SIGNED_REQUEST_LABEL));
    assert_eq!(labels.get("device.hostname").map(String::as_str), Some("edge-01"));
    assert_eq!(labels.get("device.cpu-architecture").map(String::as_str), Some("aarch64"));
    assert_eq!(d.status.unwrap().hardware, Some(hardware()));

    let events = gw.events.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, reasons::REGISTERED);
    assert_eq!(events[0].object, "edge/edge-01");
}

#[tokio::test]
async fn test_second_bootstrap_registration_is_forbidden() {
    let gw = gateway();
    approved_device(&gw, "edge-01");
    let chain = gw.bootstrap_chain().await;
    let auth = gw.auth(&chain, AuthClass::Register).await;

    register(&gw.state, &auth, &chain, "edge-01", registration("edge-01", None))
        .await
        .unwrap();
    let err = register(&gw.state, &auth, &chain, "edge-01", registration("edge-01", None))
        .await
        .unwrap_err();

    assert_eq!(err.status(), StatusCode::FORBIDDEN);
    assert_eq!(gw.state.metrics.registration_failures.get(), 1);
}

#[tokio::test]
async fn test_register_before_approval_is_not_a_failure() {
    let gw = gateway();
    gw.store.put_signed_request(signed_request("edgefleet", "edge-01", "edge", false));
    let chain = gw.bootstrap_chain().await;
    let auth = gw.auth(&chain, AuthClass::Register).await;

    let err = register(&gw.state, &auth, &chain, "edge-01", registration("edge-01", None))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::NOT_FOUND);

    let err = register(&gw.state, &auth, &chain, "edge-02", registration("edge-02", None))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::NOT_FOUND);

    assert_eq!(gw.state.metrics.registration_failures.get(), 0);
}

#[tokio::test]
async fn test_expired_bootstrap_certificate_still_registers() {
    let gw = gateway();
    approved_device(&gw, "edge-01");
    let chain = gw.expired_bootstrap_chain().await;
    let auth = gw.auth(&chain, AuthClass::Register).await;
    assert!(auth.is_bootstrap());

    let response = register(&gw.state, &auth, &chain, "edge-01", registration("edge-01", None)).await;
    assert!(response.is_ok());
}

#[tokio::test]
async fn test_renewal_with_device_certificate() {
    let gw = gateway();
    gw.store.put_device(device("edge", "edge-01", &[]));
    let chain = gw.device_chain("edge-01", "edge").await;
    let auth = gw.auth(&chain, AuthClass::Register).await;

    let response = register(&gw.state, &auth, &chain, "edge-01", registration("edge-01", None))
        .await
        .unwrap();
    let cert = PeerCertificate::from_pem(&response.certificate).unwrap();
    assert_eq!(cert.org_unit().as_deref(), Some("edge"));
}

#[tokio::test]
async fn test_renewal_for_another_device_is_forbidden() {
    let gw = gateway();
    gw.store.put_device(device("edge", "edge-02", &[]));
    let chain = gw.device_chain("edge-01", "edge").await;
    let auth = gw.auth(&chain, AuthClass::Register).await;

    let err = register(&gw.state, &auth, &chain, "edge-02", registration("edge-02", None))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::FORBIDDEN);
    assert_eq!(gw.state.metrics.invalid_owner.get(), 1);
}

#[tokio::test]
async fn test_invalid_csr_is_bad_request() {
    let gw = gateway();
    approved_device(&gw, "edge-01");
    let chain = gw.bootstrap_chain().await;
    let auth = gw.auth(&chain, AuthClass::Register).await;

    let info = RegistrationInfo {
        certificate_request: "not a csr".into(),
        hardware: None,
    };
    let err = register(&gw.state, &auth, &chain, "edge-01", info).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(gw.state.metrics.registration_failures.get(), 1);
}
