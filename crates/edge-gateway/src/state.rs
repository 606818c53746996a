//! Shared handler state

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_pki::{CaProvider, DEFAULT_CLIENT_CERT_EXPIRATION_DAYS};
use fleet_store::{EventPublisher, FleetStore};

use crate::metrics::GatewayMetrics;

/// Gateway settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// mTLS listen address
    pub addr: SocketAddr,
    /// Namespace receiving signed requests
    pub initial_namespace: String,
    /// Validity of issued device certificates
    pub client_cert_expiration_days: i64,
    /// Create signed requests already approved
    pub auto_approval: bool,
    /// Server-wide request timeout
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8043)),
            initial_namespace: "edgefleet".to_string(),
            client_cert_expiration_days: DEFAULT_CLIENT_CERT_EXPIRATION_DAYS,
            auto_approval: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared by every handler
///
/// Nothing here is mutable apart from what sits behind the store and the
/// CA provider.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FleetStore>,
    pub events: Arc<dyn EventPublisher>,
    pub ca: Arc<CaProvider>,
    pub metrics: Arc<GatewayMetrics>,
    pub config: Arc<GatewayConfig>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
