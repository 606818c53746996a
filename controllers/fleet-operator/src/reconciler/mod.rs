//! Reconciliation logic for EdgeFleet CRDs.
//!
//! - `workload`: selector projection, workload finalizer, forward/reverse
//!   device binding
//! - `device`: the symmetric device-labels binding and device teardown
//! - `signed_request`: approved signed requests become devices
//! - `auto_config`: per-device workloads materialised from templates

pub mod auto_config;
pub mod device;
pub mod signed_request;
pub mod workload;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fleet_store::{EventPublisher, FleetStore};
use tracing::warn;

use crate::backoff::FibonacciBackoff;

/// Backoff state for a resource
#[derive(Debug, Clone, Default)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn increment_error(&mut self) {
        self.error_count += 1;
    }
}

/// Reconciles EdgeFleet resources against the object store.
pub struct Reconciler {
    pub(crate) store: Arc<dyn FleetStore>,
    pub(crate) events: Arc<dyn EventPublisher>,
    /// Device fan-out within one workload reconcile
    pub(crate) workload_concurrency: usize,
    /// Error count tracking per resource (kind:namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("workload_concurrency", &self.workload_concurrency)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over `store`.
    pub fn new(store: Arc<dyn FleetStore>, events: Arc<dyn EventPublisher>, workload_concurrency: usize) -> Self {
        Self {
            store,
            events,
            workload_concurrency: workload_concurrency.max(1),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the Fibonacci backoff for a resource, advancing its sequence
    ///
    /// Returns (backoff_seconds, error_count)
    pub fn get_backoff_for_resource(&self, resource_key: &str) -> (u64, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states.entry(resource_key.to_string()).or_default();
                (state.backoff.next_backoff_seconds(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (crate::backoff::MIN_BACKOFF_SECONDS, 0)
            }
        }
    }

    /// Increment error count for a resource
    pub fn increment_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.entry(resource_key.to_string()).or_default().increment_error();
        }
    }

    /// Forget a resource's backoff (on successful reconciliation)
    ///
    /// A finalized object's last successful reconcile drops its entry too.
    pub fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }

    #[cfg(test)]
    fn tracked_resources(&self) -> usize {
        self.backoff_states.lock().map_or(0, |states| states.len())
    }
}
