//! EdgeFleet Operator
//!
//! Runs, in one process:
//! - the mTLS edge gateway spoken to by device agents
//! - the EdgeWorkload, EdgeDevice, EdgeDeviceSignedRequest and
//!   EdgeAutoConfig controllers
//! - a plain HTTP server for `/metrics`, `/healthz` and `/readyz`
//!
//! With leader election enabled only the lease holder serves the gateway and
//! runs the controllers; losing the lease exits cleanly so the replica can
//! rejoin the election.

mod backoff;
mod config;
mod controller;
mod error;
mod http;
mod leader;
mod reconcile_helpers;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum_server::Handle;
use edge_gateway::{AppState, GatewayMetrics};
use fleet_pki::CaProvider;
use fleet_store::{EventPublisher, FleetStore, KubeEventPublisher, KubeStore};
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::OperatorConfig;
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::http::ProbeState;
use crate::leader::LeaderElector;
use crate::reconciler::Reconciler;

const EVENT_COMPONENT: &str = "edgefleet-operator";
const GATEWAY_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let config = OperatorConfig::from_env()?;

    // RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting EdgeFleet operator");
    info!("Configuration:");
    info!("  Gateway port: {}", config.https_port);
    info!("  Probe port: {}", config.http_port);
    info!("  Domains: {}", config.domains.join(","));
    info!("  Operator namespace: {}", config.operator_namespace);
    info!("  Initial device namespace: {}", config.initial_device_namespace);
    info!("  Watch namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!(
        "  Concurrency: {} reconcile(s) per controller, {} device worker(s) per workload",
        config.reconcile_concurrency, config.workload_concurrency
    );
    if config.webhooks {
        info!("  Webhooks enabled; admission webhooks are served outside the operator");
    }

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }

    let client = Client::try_default().await?;
    let store: Arc<dyn FleetStore> = Arc::new(KubeStore::new(client.clone()));
    let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(client.clone(), EVENT_COMPONENT));
    let metrics = Arc::new(
        GatewayMetrics::new().map_err(|e| ControllerError::Server(format!("failed to register metrics: {e}")))?,
    );

    let ready = Arc::new(AtomicBool::new(false));
    let probe = tokio::spawn(http::serve(
        config.http_addr(),
        ProbeState {
            metrics: metrics.clone(),
            ready: ready.clone(),
        },
    ));

    let mut leadership = if config.leader_election {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &config.operator_namespace,
            &leader::identity(),
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    let ca = Arc::new(CaProvider::new(store.clone(), config.operator_namespace.clone()));
    let server_cert = ca.get_or_create_server_cert(&config.domains, config.tls_local).await?;
    ca.ensure_bootstrap_cert().await?;
    info!("Certificate authority ready in namespace {}", config.operator_namespace);

    let state = AppState {
        store: store.clone(),
        events: events.clone(),
        ca,
        metrics,
        config: Arc::new(config.gateway_config()),
    };
    let handle = Handle::new();
    let gateway = {
        let handle = handle.clone();
        tokio::spawn(async move { edge_gateway::serve(state, &server_cert, handle).await })
    };

    let reconciler = Arc::new(Reconciler::new(store, events, config.workload_concurrency));
    let controller = Controller::start(
        client,
        reconciler,
        config.watch_namespace.as_deref(),
        config.reconcile_concurrency,
    );

    ready.store(true, Ordering::SeqCst);
    info!("EdgeFleet operator ready");

    let result = tokio::select! {
        result = gateway => match result {
            Ok(Ok(())) => Err(ControllerError::Server("gateway stopped".to_string())),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(ControllerError::Server(format!("gateway task panicked: {e}"))),
        },
        result = probe => match result {
            Ok(Ok(())) => Err(ControllerError::Server("probe server stopped".to_string())),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(ControllerError::Server(format!("probe server task panicked: {e}"))),
        },
        result = controller.run() => result,
        () = async {
            match leadership.as_mut() {
                Some(guard) => guard.lost().await,
                None => std::future::pending().await,
            }
        } => {
            info!("Leadership lost, exiting for re-election");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    ready.store(false, Ordering::SeqCst);
    handle.graceful_shutdown(Some(GATEWAY_SHUTDOWN_GRACE));
    if let Some(guard) = &leadership {
        guard.release().await;
    }
    result
}
