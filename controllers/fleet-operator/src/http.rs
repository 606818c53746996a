//! Plain HTTP server for `/metrics`, `/healthz` and `/readyz`

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use edge_gateway::GatewayMetrics;
use tracing::{error, info};

use crate::error::ControllerError;

/// State of the probe server
#[derive(Debug, Clone)]
pub struct ProbeState {
    pub metrics: Arc<GatewayMetrics>,
    /// Set once the gateway and controllers are up
    pub ready: Arc<AtomicBool>,
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Probe and metrics routes
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Serve the probe routes on `addr` until the process exits
pub async fn serve(addr: SocketAddr, state: ProbeState) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Server(format!("failed to bind {addr}: {e}")))?;
    info!("Serving /metrics, /healthz and /readyz on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ControllerError::Server(format!("probe server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> ProbeState {
        ProbeState {
            metrics: Arc::new(GatewayMetrics::new().unwrap()),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn get_path(state: &ProbeState, path: &str) -> (StatusCode, String) {
        let response = router(state.clone())
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_is_always_ok() {
        let s = state();
        assert_eq!(get_path(&s, "/healthz").await, (StatusCode::OK, "ok".to_string()));
    }

    #[tokio::test]
    async fn test_readyz_follows_flag() {
        let s = state();
        assert_eq!(get_path(&s, "/readyz").await.0, StatusCode::SERVICE_UNAVAILABLE);

        s.ready.store(true, Ordering::SeqCst);
        assert_eq!(get_path(&s, "/readyz").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposes_gateway_counters() {
        let s = state();
        s.metrics.enrolments.inc();

        let (status, body) = get_path(&s, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("edgefleet_enrolments_total 1"));
    }
}
