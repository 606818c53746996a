//! EdgeFleet edge gateway
//!
//! HTTPS endpoint spoken to by edge agents. Mutual TLS identifies the
//! peer: the shared bootstrap certificate may only enrol and register,
//! device certificates (CN = device, OU = namespace) reach everything else
//! for their own device.
//!
//! # Routes
//!
//! All under `/api/edgefleet-management/v1`:
//!
//! - `GET  /data/{device_id}/in`: configuration poll
//! - `POST /data/{device_id}/out`: `enrolment`, `registration`, `heartbeat`
//! - `GET  /control/{device_id}/in`: `disconnect` once the device is deleted
//! - `POST /control/{device_id}/out`: control acknowledgements

pub mod assembler;
pub mod auth;
pub mod enrolment;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod server;
pub mod state;
pub mod tls;

#[cfg(test)]
mod test_support;

pub use error::{AssemblyError, GatewayError, Result};
pub use metrics::GatewayMetrics;
pub use server::{API_PREFIX, router, serve};
pub use state::{AppState, GatewayConfig};
pub use tls::ClientCertChain;
