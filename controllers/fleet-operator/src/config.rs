//! Operator configuration
//!
//! Read once from environment variables at startup. Any malformed value is a
//! fatal configuration error.

use std::net::SocketAddr;
use std::time::Duration;

use edge_gateway::GatewayConfig;

use crate::error::ControllerError;

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_HTTPS_PORT: u16 = 8043;
const DEFAULT_DOMAIN: &str = "project-edgefleet.io";
const DEFAULT_NAMESPACE: &str = "edgefleet";
const DEFAULT_CLIENT_CERT_EXPIRATION_DAYS: i64 = 30;
const DEFAULT_RECONCILE_CONCURRENCY: u16 = 3;
const DEFAULT_WORKLOAD_CONCURRENCY: usize = 5;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Operator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Plain HTTP port for `/metrics`, `/healthz` and `/readyz`
    pub http_port: u16,
    /// mTLS gateway port
    pub https_port: u16,
    /// DNS SANs of the gateway server certificate
    pub domains: Vec<String>,
    /// Add loopback SANs to the server certificate
    pub tls_local: bool,
    /// Tracing filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Validity of issued device certificates
    pub client_cert_expiration_days: i64,
    /// Namespace holding the CA and bootstrap Secrets and the leader Lease
    pub operator_namespace: String,
    /// Namespace receiving signed requests
    pub initial_device_namespace: String,
    pub leader_election: bool,
    /// Concurrent reconciles per controller
    pub reconcile_concurrency: u16,
    /// Device fan-out within one workload reconcile
    pub workload_concurrency: usize,
    pub auto_approval: bool,
    pub webhooks: bool,
    pub request_timeout: Duration,
    /// Restrict the controllers to one namespace
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            domains: vec![DEFAULT_DOMAIN.to_string()],
            tls_local: false,
            log_level: "info".to_string(),
            client_cert_expiration_days: DEFAULT_CLIENT_CERT_EXPIRATION_DAYS,
            operator_namespace: DEFAULT_NAMESPACE.to_string(),
            initial_device_namespace: DEFAULT_NAMESPACE.to_string(),
            leader_election: false,
            reconcile_concurrency: DEFAULT_RECONCILE_CONCURRENCY,
            workload_concurrency: DEFAULT_WORKLOAD_CONCURRENCY,
            auto_approval: false,
            webhooks: false,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            watch_namespace: None,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    match raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={v:?}: {e}"))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: Option<String>, default: bool) -> Result<bool, ControllerError> {
    match raw.map(|v| v.trim().to_lowercase()).as_deref() {
        None | Some("") => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ControllerError::InvalidConfig(format!(
            "{key}={other:?}: expected true or false"
        ))),
    }
}

fn non_empty(raw: Option<String>, default: &str) -> String {
    raw.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let config = Self {
            http_port: parse("HTTP_PORT", lookup("HTTP_PORT"), DEFAULT_HTTP_PORT)?,
            https_port: parse("HTTPS_PORT", lookup("HTTPS_PORT"), DEFAULT_HTTPS_PORT)?,
            domains: non_empty(lookup("DOMAIN"), DEFAULT_DOMAIN)
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect(),
            tls_local: parse_bool("TLS_LOCAL_ENABLED", lookup("TLS_LOCAL_ENABLED"), false)?,
            log_level: non_empty(lookup("LOG_LEVEL"), "info"),
            client_cert_expiration_days: parse(
                "CLIENT_CERT_EXPIRATION_DAYS",
                lookup("CLIENT_CERT_EXPIRATION_DAYS"),
                DEFAULT_CLIENT_CERT_EXPIRATION_DAYS,
            )?,
            operator_namespace: non_empty(lookup("OPERATOR_NAMESPACE"), DEFAULT_NAMESPACE),
            initial_device_namespace: non_empty(lookup("INITIAL_DEVICE_NAMESPACE"), DEFAULT_NAMESPACE),
            leader_election: parse_bool("ENABLE_LEADER_ELECTION", lookup("ENABLE_LEADER_ELECTION"), false)?,
            reconcile_concurrency: parse(
                "RECONCILE_CONCURRENCY",
                lookup("RECONCILE_CONCURRENCY"),
                DEFAULT_RECONCILE_CONCURRENCY,
            )?,
            workload_concurrency: parse(
                "EDGE_WORKLOAD_CONCURRENCY",
                lookup("EDGE_WORKLOAD_CONCURRENCY"),
                DEFAULT_WORKLOAD_CONCURRENCY,
            )?,
            auto_approval: parse_bool("AUTO_APPROVAL", lookup("AUTO_APPROVAL"), false)?,
            webhooks: parse_bool("ENABLE_WEBHOOKS", lookup("ENABLE_WEBHOOKS"), false)?,
            request_timeout: Duration::from_secs(parse(
                "REQUEST_TIMEOUT_SECONDS",
                lookup("REQUEST_TIMEOUT_SECONDS"),
                DEFAULT_REQUEST_TIMEOUT_SECONDS,
            )?),
            watch_namespace: lookup("WATCH_NAMESPACE")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        if self.client_cert_expiration_days < 1 {
            return Err(ControllerError::InvalidConfig(
                "CLIENT_CERT_EXPIRATION_DAYS must be at least 1".to_string(),
            ));
        }
        if self.reconcile_concurrency == 0 || self.workload_concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_CONCURRENCY and EDGE_WORKLOAD_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "REQUEST_TIMEOUT_SECONDS must be at least 1".to_string(),
            ));
        }
        if self.domains.is_empty() {
            return Err(ControllerError::InvalidConfig("DOMAIN lists no names".to_string()));
        }
        Ok(())
    }

    /// Settings handed to the edge gateway
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            addr: SocketAddr::from(([0, 0, 0, 0], self.https_port)),
            initial_namespace: self.initial_device_namespace.clone(),
            client_cert_expiration_days: self.client_cert_expiration_days,
            auto_approval: self.auto_approval,
            request_timeout: self.request_timeout,
        }
    }

    /// Listen address of the probe and metrics server
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.http_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<OperatorConfig, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        OperatorConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.gateway_config().addr.port(), 8043);
        assert_eq!(config.http_addr().port(), 8080);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("HTTPS_PORT", "9443"),
            ("DOMAIN", "edge.example.com, gw.example.com,"),
            ("TLS_LOCAL_ENABLED", "TRUE"),
            ("CLIENT_CERT_EXPIRATION_DAYS", "7"),
            ("EDGE_WORKLOAD_CONCURRENCY", "12"),
            ("AUTO_APPROVAL", "1"),
            ("WATCH_NAMESPACE", "edge"),
        ])
        .unwrap();

        assert_eq!(config.https_port, 9443);
        assert_eq!(config.domains, vec!["edge.example.com", "gw.example.com"]);
        assert!(config.tls_local);
        assert_eq!(config.workload_concurrency, 12);
        assert_eq!(config.watch_namespace.as_deref(), Some("edge"));

        let gateway = config.gateway_config();
        assert_eq!(gateway.client_cert_expiration_days, 7);
        assert!(gateway.auto_approval);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(load(&[("HTTP_PORT", "http")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(load(&[("AUTO_APPROVAL", "maybe")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(
            load(&[("CLIENT_CERT_EXPIRATION_DAYS", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("EDGE_WORKLOAD_CONCURRENCY", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
