//! Gateway router and mTLS listener

use axum::Router;
use axum::routing::get;
use axum_server::Handle;
use fleet_pki::CertKeyPair;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::handlers::{poll_configuration, poll_control, post_control, post_data};
use crate::state::AppState;
use crate::tls::{PeerCertAcceptor, server_config};

/// Prefix of every agent route
pub const API_PREFIX: &str = "/api/edgefleet-management/v1";

/// Agent routes with tracing and the server-wide timeout applied
pub fn router(state: AppState) -> Router {
    let timeout = state.config.request_timeout;
    let api = Router::new()
        .route("/data/{device_id}/in", get(poll_configuration))
        .route("/data/{device_id}/out", axum::routing::post(post_data))
        .route("/control/{device_id}/in", get(poll_control))
        .route("/control/{device_id}/out", axum::routing::post(post_control));

    Router::new()
        .nest(API_PREFIX, api)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway on `state.config.addr` until `handle` shuts it down
///
/// The TLS handshake demands a client certificate; its chain is attached
/// to each request for the handlers to classify.
pub async fn serve(state: AppState, server_cert: &CertKeyPair, handle: Handle) -> Result<()> {
    let addr = state.config.addr;
    let acceptor = PeerCertAcceptor::new(server_config(server_cert)?);
    let app = router(state);

    info!(%addr, "Starting edge gateway");
    axum_server::bind(addr)
        .acceptor(acceptor)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| GatewayError::Server(format!("gateway server error: {e}")))
}
