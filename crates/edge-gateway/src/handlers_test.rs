use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use crds::labels::{DEVICE_CONNECTION_FINALIZER, DEVICE_WORKLOAD_FINALIZER, bootstrap_device_labels};
use fleet_pki::{CertificateRequest, parse_pem};
use fleet_store::FleetStore;
use fleet_store::mock::fixtures::{bound_device, device};
use serde_json::json;
use tower::ServiceExt;

use crate::models::{Message, RegistrationResponse};
use crate::server::{API_PREFIX, router};
use crate::test_support::{TestGateway, gateway};
use crate::tls::ClientCertChain;

fn envelope(directive: &str, content: serde_json::Value) -> String {
    json!({
        "type": "data",
        "message_id": "m-1",
        "version": 1,
        "directive": directive,
        "content": content,
    })
    .to_string()
}

fn get(path: &str, chain: Option<&ClientCertChain>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(format!("{API_PREFIX}{path}"));
    if let Some(chain) = chain {
        builder = builder.extension(chain.clone());
    }
    builder.body(Body::empty()).unwrap()
}

fn post(path: &str, chain: Option<&ClientCertChain>, body: String) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("{API_PREFIX}{path}"))
        .header("content-type", "application/json");
    if let Some(chain) = chain {
        builder = builder.extension(chain.clone());
    }
    builder.body(Body::from(body)).unwrap()
}

async fn send(gw: &TestGateway, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router(gw.state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn message(gw: &TestGateway, request: Request<Body>) -> Message {
    let (status, body) = send(gw, request).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_enrol_register_poll_heartbeat() {
    let gw = gateway();
    let bootstrap = gw.bootstrap_chain().await;

    let enrolment = envelope("enrolment", json!({"targetNamespace": "edge"}));
    let (status, _) = send(&gw, post("/data/edge-01/out", Some(&bootstrap), enrolment.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&gw, post("/data/edge-01/out", Some(&bootstrap), enrolment)).await;
    assert_eq!(status, StatusCode::OK);

    // Approval happens in the operator
    let mut d = device("edge", "edge-01", &[]);
    d.metadata.labels = Some(bootstrap_device_labels(None));
    gw.store.put_device(d);

    let request = CertificateRequest::new("edge-01").unwrap();
    let registration = envelope("registration", json!({"certificateRequest": request.csr_pem()}));
    let reply = message(&gw, post("/data/edge-01/out", Some(&bootstrap), registration)).await;
    assert_eq!(reply.directive, "registration");
    let issued: RegistrationResponse = reply.payload().unwrap();
    let device_chain = ClientCertChain::new(vec![parse_pem(&issued.certificate).unwrap()]);

    let config = message(&gw, get("/data/edge-01/in", Some(&device_chain))).await;
    assert_eq!(config.directive, "configuration");
    assert_eq!(config.content["deviceId"], "edge-01");

    let heartbeat = envelope("heartbeat", json!({"status": "up", "version": "7"}));
    let (status, _) = send(&gw, post("/data/edge-01/out", Some(&device_chain), heartbeat)).await;
    assert_eq!(status, StatusCode::OK);

    let d = gw.store.get_device("edge", "edge-01").await.unwrap().unwrap();
    assert_eq!(d.status.unwrap().phase.as_deref(), Some("up"));
}

#[tokio::test]
async fn test_missing_certificate_is_bad_request() {
    let gw = gateway();
    let (status, _) = send(&gw, get("/data/edge-01/in", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bootstrap_certificate_cannot_poll() {
    let gw = gateway();
    let bootstrap = gw.bootstrap_chain().await;

    let (status, _) = send(&gw, get("/data/register/in", Some(&bootstrap))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        gw.state.metrics.failed_auth.with_label_values(&["bootstrap_identity"]).get(),
        1
    );
}

#[tokio::test]
async fn test_expired_bootstrap_certificate_can_enrol() {
    let gw = gateway();
    let expired = gw.expired_bootstrap_chain().await;
    let (status, _) = send(
        &gw,
        post("/data/edge-01/out", Some(&expired), envelope("enrolment", json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_foreign_device_is_forbidden() {
    let gw = gateway();
    gw.store.put_device(device("edge", "edge-02", &[]));
    let chain = gw.device_chain("edge-01", "edge").await;

    let (status, _) = send(&gw, get("/data/edge-02/in", Some(&chain))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let heartbeat = envelope("heartbeat", json!({"status": "up"}));
    let (status, _) = send(&gw, post("/data/edge-02/out", Some(&chain), heartbeat)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(gw.state.metrics.invalid_owner.get(), 2);
}

#[tokio::test]
async fn test_device_id_is_case_insensitive() {
    let gw = gateway();
    gw.store.put_device(bound_device("edge", "edge-01", &[], &[]));
    let chain = gw.device_chain("edge-01", "edge").await;

    let config = message(&gw, get("/data/EDGE-01/in", Some(&chain))).await;
    assert_eq!(config.content["deviceId"], "edge-01");
}

#[tokio::test]
async fn test_unknown_directive_is_bad_request() {
    let gw = gateway();
    let chain = gw.device_chain("edge-01", "edge").await;
    let (status, body) = send(
        &gw,
        post("/data/edge-01/out", Some(&chain), envelope("reboot", json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("reboot"));
}

#[tokio::test]
async fn test_unknown_device_poll_is_not_found() {
    let gw = gateway();
    let chain = gw.device_chain("edge-01", "edge").await;
    let (status, _) = send(&gw, get("/data/edge-01/in", Some(&chain))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_control_idle_for_live_device() {
    let gw = gateway();
    gw.store.put_device(device("edge", "edge-01", &[]));
    let chain = gw.device_chain("edge-01", "edge").await;

    let (status, body) = send(&gw, get("/control/edge-01/in", Some(&chain))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_control_disconnects_tombstoned_device() {
    let gw = gateway();
    let mut d = device("edge", "edge-01", &[]);
    d.metadata.finalizers = Some(vec![
        DEVICE_CONNECTION_FINALIZER.to_string(),
        DEVICE_WORKLOAD_FINALIZER.to_string(),
    ]);
    gw.store.put_device(d);
    gw.store.delete_device("edge", "edge-01");
    let chain = gw.device_chain("edge-01", "edge").await;

    // Bindings not stripped yet
    let (status, _) = send(&gw, get("/control/edge-01/in", Some(&chain))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let current = gw.store.get_device("edge", "edge-01").await.unwrap().unwrap();
    gw.store
        .patch_device_finalizers(&current, &[DEVICE_WORKLOAD_FINALIZER.to_string()])
        .await
        .unwrap();

    let reply = message(&gw, get("/control/edge-01/in", Some(&chain))).await;
    assert_eq!(reply.directive, "control");
    assert_eq!(reply.content["command"], "disconnect");
    assert!(gw.store.get_device("edge", "edge-01").await.unwrap().is_none());
}

#[tokio::test]
async fn test_control_acknowledgement() {
    let gw = gateway();
    let chain = gw.device_chain("edge-01", "edge").await;
    let (status, _) = send(
        &gw,
        post("/control/edge-01/out", Some(&chain), envelope("control", json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
