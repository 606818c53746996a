//! Shared fixtures for gateway tests

use std::sync::Arc;

use fleet_pki::{CaProvider, CertificateRequest, REGISTER_COMMON_NAME, parse_pem};
use fleet_store::{MockFleetStore, RecordingEventPublisher};
use time::{Duration, OffsetDateTime};

use crate::auth::{AuthClass, AuthContext, authenticate};
use crate::metrics::GatewayMetrics;
use crate::state::{AppState, GatewayConfig};
use crate::tls::ClientCertChain;

pub struct TestGateway {
    pub state: AppState,
    pub store: MockFleetStore,
    pub events: RecordingEventPublisher,
}

pub fn gateway() -> TestGateway {
    gateway_with(GatewayConfig::default())
}

pub fn gateway_with(config: GatewayConfig) -> TestGateway {
    let store = MockFleetStore::new();
    let events = RecordingEventPublisher::default();
    let state = AppState {
        store: Arc::new(store.clone()),
        events: Arc::new(events.clone()),
        ca: Arc::new(CaProvider::new(Arc::new(store.clone()), "edgefleet-system")),
        metrics: Arc::new(GatewayMetrics::new().unwrap()),
        config: Arc::new(config),
    };
    TestGateway { state, store, events }
}

impl TestGateway {
    pub async fn bootstrap_chain(&self) -> ClientCertChain {
        let ca = self.state.ca.get_or_create_ca().await.unwrap();
        let pair = ca.issue_bootstrap_cert().unwrap();
        ClientCertChain::new(vec![parse_pem(&pair.cert_pem).unwrap()])
    }

    pub async fn expired_bootstrap_chain(&self) -> ClientCertChain {
        let ca = self.state.ca.get_or_create_ca().await.unwrap();
        let now = OffsetDateTime::now_utc();
        let pair = ca
            .issue_client_cert(REGISTER_COMMON_NAME, None, now - Duration::days(400), now - Duration::days(10))
            .unwrap();
        ClientCertChain::new(vec![parse_pem(&pair.cert_pem).unwrap()])
    }

    pub async fn device_chain(&self, name: &str, namespace: &str) -> ClientCertChain {
        let request = CertificateRequest::new(name).unwrap();
        let pem = self
            .state
            .ca
            .sign_csr(request.csr_pem(), name, namespace, 30)
            .await
            .unwrap();
        ClientCertChain::new(vec![parse_pem(&pem).unwrap()])
    }

    pub async fn auth(&self, chain: &ClientCertChain, class: AuthClass) -> AuthContext {
        let roots = self.state.ca.trust_roots().await.unwrap();
        authenticate(
            Some(chain),
            class,
            &roots,
            &self.state.config.initial_namespace,
            &self.state.metrics,
        )
        .unwrap()
    }
}
