//! Agent-facing HTTP handlers
//!
//! Every handler classifies the peer certificate first. The device id in
//! the path is compared to the certificate CN case-insensitively; the
//! device namespace always comes from the certificate.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use crds::labels::DEVICE_CONNECTION_FINALIZER;
use crds::EdgeDevice;
use serde::Serialize;
use tracing::{debug, info};

use crate::assembler::{Assembler, device_configuration};
use crate::auth::{AuthClass, AuthContext, authenticate};
use crate::enrolment::{enrol, register};
use crate::error::{GatewayError, Result};
use crate::heartbeat::process_heartbeat;
use crate::models::{
    ControlCommand, EnrolmentInfo, Heartbeat, Message, MessageType, RegistrationInfo, directives,
};
use crate::state::AppState;
use crate::tls::ClientCertChain;

type PeerChain = Option<Extension<ClientCertChain>>;

fn chain_of(chain: &PeerChain) -> Option<&ClientCertChain> {
    chain.as_ref().map(|Extension(c)| c)
}

async fn classify(state: &AppState, chain: &PeerChain, class: AuthClass) -> Result<AuthContext> {
    let roots = state.ca.trust_roots().await?;
    authenticate(
        chain_of(chain),
        class,
        &roots,
        &state.config.initial_namespace,
        &state.metrics,
    )
}

/// `device-auth` plus ownership of `device_id`
async fn authorize_device(state: &AppState, chain: &PeerChain, device_id: &str) -> Result<AuthContext> {
    let auth = classify(state, chain, AuthClass::Device).await?;
    auth.ensure_owner(device_id, &state.metrics)?;
    Ok(auth)
}

fn reply<T: Serialize>(type_: MessageType, directive: &str, content: &T) -> Result<Json<Message>> {
    let content = serde_json::to_value(content).map_err(|e| GatewayError::Server(e.to_string()))?;
    Ok(Json(Message::reply(type_, directive, content)))
}

fn payload<T: serde::de::DeserializeOwned>(message: &Message) -> Result<T> {
    message
        .payload()
        .map_err(|e| GatewayError::BadRequest(format!("invalid {} payload: {e}", message.directive)))
}

/// Tombstoned: deletion requested and bindings already stripped
fn is_tombstoned(device: &EdgeDevice) -> bool {
    device.metadata.deletion_timestamp.is_some()
        && !device
            .metadata
            .finalizers
            .iter()
            .flatten()
            .any(|f| f == DEVICE_CONNECTION_FINALIZER)
}

/// `GET /data/{device_id}/in`: configuration poll
pub async fn poll_configuration(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    chain: PeerChain,
) -> Result<Json<Message>> {
    let device_id = device_id.to_lowercase();
    let auth = authorize_device(&state, &chain, &device_id).await?;
    let configuration = device_configuration(&state, &auth.namespace, &device_id).await?;
    reply(MessageType::Data, directives::CONFIGURATION, &configuration)
}

/// `POST /data/{device_id}/out`: enrolment, registration and heartbeats
pub async fn post_data(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    chain: PeerChain,
    Json(message): Json<Message>,
) -> Result<Response> {
    let device_id = device_id.to_lowercase();
    match message.directive.as_str() {
        directives::ENROLMENT => {
            // Ownership is not checked: the bootstrap identity enrols any device
            classify(&state, &chain, AuthClass::Register).await?;
            let info: EnrolmentInfo = payload(&message)?;
            let outcome = enrol(&state, &device_id, info).await?;
            Ok(outcome.status().into_response())
        }
        directives::REGISTRATION => {
            let auth = classify(&state, &chain, AuthClass::Register).await?;
            let info: RegistrationInfo = payload(&message)?;
            let peer = chain_of(&chain).cloned().unwrap_or_default();
            let response = register(&state, &auth, &peer, &device_id, info).await?;
            Ok(reply(MessageType::Data, directives::REGISTRATION, &response)?.into_response())
        }
        directives::HEARTBEAT => {
            let auth = authorize_device(&state, &chain, &device_id).await?;
            let heartbeat: Heartbeat = payload(&message)?;
            process_heartbeat(&state, &auth.namespace, &device_id, &heartbeat).await?;
            Ok(StatusCode::OK.into_response())
        }
        other => Err(GatewayError::BadRequest(format!("unknown directive {other:?}"))),
    }
}

/// `GET /control/{device_id}/in`: disconnect tombstoned devices
pub async fn poll_control(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    chain: PeerChain,
) -> Result<Response> {
    let device_id = device_id.to_lowercase();
    let auth = authorize_device(&state, &chain, &device_id).await?;

    let Some(device) = state.store.get_device(&auth.namespace, &device_id).await? else {
        state.metrics.device_not_found.inc();
        return Err(GatewayError::NotFound(format!("device {}/{device_id}", auth.namespace)));
    };
    if !is_tombstoned(&device) {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    Assembler::new(state.store.as_ref())
        .release_workload_finalizer(&device)
        .await?;
    info!("Disconnecting deleted device {}/{}", auth.namespace, device_id);
    Ok(reply(MessageType::Command, directives::CONTROL, &ControlCommand::disconnect())?.into_response())
}

/// `POST /control/{device_id}/out`: control acknowledgements
pub async fn post_control(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    chain: PeerChain,
    Json(message): Json<Message>,
) -> Result<StatusCode> {
    let device_id = device_id.to_lowercase();
    let auth = authorize_device(&state, &chain, &device_id).await?;
    debug!(directive = %message.directive, "Control message from {}/{}", auth.namespace, device_id);
    Ok(StatusCode::OK)
}

#[cfg(test)]
#[path = "handlers_test.rs"]
mod handlers_test;
