//! Gateway Prometheus metrics

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exported on `/metrics`
#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    pub registration_failures: IntCounter,
    pub enrolments: IntCounter,
    pub heartbeats: IntCounter,
    pub invalid_owner: IntCounter,
    pub failed_auth: IntCounterVec,
    pub config_errors: IntCounter,
    pub device_not_found: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl GatewayMetrics {
    /// Register every gateway counter in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Register every gateway counter in `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let failed_auth = IntCounterVec::new(
            Opts::new("edgefleet_failed_auth_total", "Rejected client certificates"),
            &["reason"],
        )?;
        registry.register(Box::new(failed_auth.clone()))?;

        Ok(Self {
            registration_failures: counter(
                &registry,
                "edgefleet_registration_failures_total",
                "Registration attempts that failed",
            )?,
            enrolments: counter(&registry, "edgefleet_enrolments_total", "Signed requests created")?,
            heartbeats: counter(&registry, "edgefleet_heartbeats_total", "Heartbeats processed")?,
            invalid_owner: counter(
                &registry,
                "edgefleet_invalid_owner_total",
                "Requests whose certificate does not own the addressed device",
            )?,
            config_errors: counter(
                &registry,
                "edgefleet_config_errors_total",
                "Configuration assemblies failed on an unresolvable reference",
            )?,
            device_not_found: counter(
                &registry,
                "edgefleet_device_not_found_total",
                "Requests for a device that does not exist",
            )?,
            failed_auth,
            registry,
        })
    }

    /// Registry shared with other components of the process
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.enrolments.inc();
        metrics.failed_auth.with_label_values(&["expired"]).inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("edgefleet_enrolments_total 1"));
        assert!(text.contains("edgefleet_failed_auth_total{reason=\"expired\"} 1"));
    }

    #[test]
    fn test_double_registration_fails() {
        let metrics = GatewayMetrics::new().unwrap();
        assert!(GatewayMetrics::with_registry(metrics.registry().clone()).is_err());
    }
}
