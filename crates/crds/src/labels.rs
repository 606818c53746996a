//! Reserved labels and finalizers
//!
//! Label keys the operator and gateway own on `EdgeDevice` and
//! `EdgeWorkload` objects, plus the hardware label derivation used at
//! registration and on heartbeats.

use std::collections::BTreeMap;

use crate::edge_device::Hardware;

/// Prefix of the device-side binding label `workload/<name>=true`
pub const WORKLOAD_LABEL_PREFIX: &str = "workload/";

/// Prefix of the workload-side projection labels `selector/<key>`
pub const SELECTOR_LABEL_PREFIX: &str = "selector/";

/// Projection key used when a workload names its device directly
pub const SELECTOR_DEVICE_NAME_KEY: &str = "devicename";

/// Projection key shared by every `DoesNotExist` requirement
pub const SELECTOR_DOES_NOT_EXIST_KEY: &str = "doesnotexist";

/// Device set membership
pub const MEMBER_OF_LABEL: &str = "edgefleet/member-of";

/// Present on a device until it completes registration with the bootstrap cert
pub const SIGNED_REQUEST_LABEL: &str = "edgefleet/signed-request";

/// Target device of a `PlaybookExecution`
pub const DEVICE_LABEL: &str = "edgefleet/device";

/// Marks Secrets holding bootstrap registration certificates
pub const BOOTSTRAP_CERT_LABEL: &str = "edgefleet/bootstrap-cert";

/// Value used for boolean-style labels
pub const LABEL_TRUE: &str = "true";

/// Prefix of workload labels passed through to the agent's pod runtime
pub const PODMAN_LABEL_PREFIX: &str = "podman/";

/// Prefix of hardware-derived device labels
pub const HARDWARE_LABEL_PREFIX: &str = "device.";

/// Blocks workload deletion until every device binding is torn down
pub const WORKLOAD_FINALIZER: &str = "yggdrasil-device-reference-finalizer";

/// Removed once the device's workload bindings have been stripped
pub const DEVICE_CONNECTION_FINALIZER: &str = "yggdrasil-connection-finalizer";

/// Removed by the gateway when the deleted device polls for the last time
pub const DEVICE_WORKLOAD_FINALIZER: &str = "yggdrasil-workload-finalizer";

pub(crate) const MAX_LABEL_VALUE_LEN: usize = 63;

/// `workload/<name>`
pub fn workload_label(workload: &str) -> String {
    format!("{WORKLOAD_LABEL_PREFIX}{workload}")
}

/// `selector/<key>`
pub fn selector_label(key: &str) -> String {
    format!("{SELECTOR_LABEL_PREFIX}{key}")
}

/// Workload names bound to a device, read from its `workload/*` labels
pub fn bound_workloads(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .keys()
        .filter_map(|k| k.strip_prefix(WORKLOAD_LABEL_PREFIX))
        .map(str::to_string)
        .collect()
}

/// Normalise an arbitrary string into a valid label value
///
/// Lowercases, drops every character outside `[a-z0-9-._]`, trims
/// non-alphanumeric characters from both ends and caps the length at 63.
pub fn sanitize_label_value(raw: &str) -> String {
    let filtered: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_'))
        .collect();
    let capped: String = filtered.chars().take(MAX_LABEL_VALUE_LEN).collect();
    capped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Labels a freshly approved device carries until it registers
pub fn bootstrap_device_labels(device_set: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(SIGNED_REQUEST_LABEL.to_string(), LABEL_TRUE.to_string())]);
    if let Some(set) = device_set.filter(|s| !s.is_empty()) {
        labels.insert(MEMBER_OF_LABEL.to_string(), set.to_string());
    }
    labels
}

/// Labels derived from a hardware report
///
/// Empty values are skipped so that a partial report never writes an empty
/// label.
pub fn hardware_labels(hardware: &Hardware) -> BTreeMap<String, String> {
    let mut facts: Vec<(&str, Option<&str>)> = vec![("hostname", hardware.hostname.as_deref())];

    if let Some(cpu) = &hardware.cpu {
        facts.push(("cpu-architecture", cpu.architecture.as_deref()));
        facts.push(("cpu-model", cpu.model_name.as_deref()));
    }
    if let Some(vendor) = &hardware.system_vendor {
        facts.push(("system-manufacturer", vendor.manufacturer.as_deref()));
        facts.push(("system-product", vendor.product_name.as_deref()));
        facts.push(("system-serial", vendor.serial_number.as_deref()));
    }

    facts
        .into_iter()
        .filter_map(|(key, value)| {
            let value = sanitize_label_value(value?);
            (!value.is_empty()).then(|| (format!("{HARDWARE_LABEL_PREFIX}{key}"), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge_device::{Cpu, SystemVendor};

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("Intel(R) Core(TM) i7"), "intelrcoretmi7");
        assert_eq!(sanitize_label_value("  -ARM64_v8.2-  "), "arm64_v8.2");
        assert_eq!(sanitize_label_value("!!!"), "");

        let long = "a".repeat(80);
        assert_eq!(sanitize_label_value(&long).len(), 63);
    }

    #[test]
    fn test_hardware_labels() {
        let hw = Hardware {
            hostname: Some("Edge-01.local".into()),
            cpu: Some(Cpu {
                architecture: Some("x86_64".into()),
                model_name: Some("Intel Atom".into()),
            }),
            system_vendor: Some(SystemVendor {
                manufacturer: Some("Dell Inc.".into()),
                product_name: None,
                serial_number: Some("SN-123".into()),
                is_virtual: false,
            }),
            ..Default::default()
        };

        let labels = hardware_labels(&hw);
        assert_eq!(labels.get("device.hostname").map(String::as_str), Some("edge-01.local"));
        assert_eq!(labels.get("device.cpu-architecture").map(String::as_str), Some("x86_64"));
        assert_eq!(labels.get("device.cpu-model").map(String::as_str), Some("intelatom"));
        assert_eq!(labels.get("device.system-manufacturer").map(String::as_str), Some("dellinc"));
        assert_eq!(labels.get("device.system-serial").map(String::as_str), Some("sn-123"));
        assert!(!labels.contains_key("device.system-product"));
    }

    #[test]
    fn test_bound_workloads() {
        let labels = BTreeMap::from([
            ("workload/nginx".to_string(), "true".to_string()),
            ("workload/agent".to_string(), "true".to_string()),
            ("tier".to_string(), "edge".to_string()),
        ]);
        assert_eq!(bound_workloads(&labels), vec!["agent", "nginx"]);
    }
}
