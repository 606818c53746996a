//! Device-level settings of the configuration message
//!
//! Every block resolves device override first, then the device set, then a
//! built-in default.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crds::{
    EdgeDevice, EdgeDeviceSet, HeartbeatConfiguration, LogCollectionConfig, MetricsConfiguration,
    NameRef, OsInformation, StorageConfiguration,
};
use fleet_store::FleetStore;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use tracing::debug;

use crate::error::AssemblyError;
use crate::models::{
    AllowList, LogCollectionDescriptor, MetricsDescriptor, MetricsReceiverDescriptor,
    S3StorageDescriptor, StorageDescriptor, SyslogDescriptor, SystemMetricsDescriptor,
};

/// ConfigMap key holding a metrics allow-list
pub const ALLOW_LIST_KEY: &str = "metrics_list.yaml";

/// Secret key holding a PEM CA bundle
pub const CA_BUNDLE_KEY: &str = "ca.crt";

/// Default system metrics scrape interval in seconds
pub const DEFAULT_SYSTEM_METRICS_INTERVAL: i32 = 60;

const SYSLOG_KIND: &str = "syslog";
const DEFAULT_SYSLOG_PROTOCOL: &str = "tcp";

fn config_error(msg: impl Into<String>) -> AssemblyError {
    AssemblyError::Configuration(msg.into())
}

/// Device override or set default of one spec field
fn overlay<'a, T>(device: Option<&'a T>, set: Option<&'a T>) -> Option<&'a T> {
    device.or(set)
}

pub fn heartbeat(device: &EdgeDevice, set: Option<&EdgeDeviceSet>) -> HeartbeatConfiguration {
    overlay(
        device.spec.heartbeat.as_ref(),
        set.and_then(|s| s.spec.heartbeat.as_ref()),
    )
    .cloned()
    .unwrap_or_default()
}

pub fn os_information(device: &EdgeDevice, set: Option<&EdgeDeviceSet>) -> Option<OsInformation> {
    overlay(
        device.spec.os_information.as_ref(),
        set.and_then(|s| s.spec.os_information.as_ref()),
    )
    .cloned()
}

async fn config_map(store: &dyn FleetStore, namespace: &str, name: &str) -> Result<ConfigMap, AssemblyError> {
    store
        .get_config_map(namespace, name)
        .await?
        .ok_or_else(|| config_error(format!("configmap {namespace}/{name} not found")))
}

async fn secret(store: &dyn FleetStore, namespace: &str, name: &str) -> Result<Secret, AssemblyError> {
    store
        .get_secret(namespace, name)
        .await?
        .ok_or_else(|| config_error(format!("secret {namespace}/{name} not found")))
}

fn cm_value(cm: &ConfigMap, key: &str) -> Option<String> {
    cm.data.as_ref().and_then(|d| d.get(key)).cloned()
}

fn required_cm_value(cm: &ConfigMap, key: &str) -> Result<String, AssemblyError> {
    cm_value(cm, key).ok_or_else(|| {
        config_error(format!(
            "configmap {} has no key {key}",
            cm.metadata.name.as_deref().unwrap_or_default()
        ))
    })
}

fn secret_value(secret: &Secret, key: &str) -> Result<String, AssemblyError> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| config_error(format!("secret {name} has no key {key}")))?;
    String::from_utf8(raw.0.clone()).map_err(|_| config_error(format!("secret {name} key {key} is not UTF-8")))
}

async fn s3_descriptor(
    store: &dyn FleetStore,
    namespace: &str,
    config_map_name: &str,
    secret_name: &str,
) -> Result<S3StorageDescriptor, AssemblyError> {
    let cm = config_map(store, namespace, config_map_name).await?;
    let creds = secret(store, namespace, secret_name).await?;

    let port = required_cm_value(&cm, "BUCKET_PORT")?;
    let bucket_port = port
        .trim()
        .parse::<i32>()
        .map_err(|_| config_error(format!("configmap {namespace}/{config_map_name}: invalid BUCKET_PORT {port:?}")))?;

    Ok(S3StorageDescriptor {
        bucket_name: required_cm_value(&cm, "BUCKET_NAME")?,
        bucket_host: required_cm_value(&cm, "BUCKET_HOST")?,
        bucket_port,
        bucket_region: cm_value(&cm, "BUCKET_REGION"),
        aws_access_key_id: secret_value(&creds, "AWS_ACCESS_KEY_ID")?,
        aws_secret_access_key: secret_value(&creds, "AWS_SECRET_ACCESS_KEY")?,
        aws_ca_bundle: cm_value(&cm, "BUCKET_CA_BUNDLE").map(|pem| STANDARD.encode(pem)),
    })
}

/// Storage block
///
/// A provisioned bucket claim wins. Its ConfigMap and Secret share the
/// claim's name and may lag behind the claim, so their absence just omits
/// the block. An external S3 configuration must resolve.
pub async fn storage(
    store: &dyn FleetStore,
    device: &EdgeDevice,
    set: Option<&EdgeDeviceSet>,
) -> Result<Option<StorageDescriptor>, AssemblyError> {
    let namespace = device.metadata.namespace.as_deref().unwrap_or_default();

    if let Some(claim) = device.status.as_ref().and_then(|s| s.data_obc.as_deref()) {
        return match s3_descriptor(store, namespace, claim, claim).await {
            Ok(s3) => Ok(Some(StorageDescriptor { s3 })),
            Err(AssemblyError::Configuration(msg)) => {
                debug!("Bucket claim {}/{} not ready: {}", namespace, claim, msg);
                Ok(None)
            }
            Err(e) => Err(e),
        };
    }

    let spec: Option<&StorageConfiguration> = overlay(
        device.spec.storage.as_ref(),
        set.and_then(|s| s.spec.storage.as_ref()),
    );
    let Some(s3) = spec.and_then(|s| s.s3.as_ref()) else {
        return Ok(None);
    };
    match (s3.config_map_name.as_deref(), s3.secret_name.as_deref()) {
        (Some(cm), Some(secret)) => Ok(Some(StorageDescriptor {
            s3: s3_descriptor(store, namespace, cm, secret).await?,
        })),
        _ => Ok(None),
    }
}

/// Materialize an allow-list ConfigMap
pub async fn allow_list(store: &dyn FleetStore, namespace: &str, reference: &NameRef) -> Result<AllowList, AssemblyError> {
    let cm = config_map(store, namespace, &reference.name).await?;
    let raw = required_cm_value(&cm, ALLOW_LIST_KEY)?;
    serde_yaml::from_str(&raw)
        .map_err(|e| config_error(format!("configmap {namespace}/{}: invalid {ALLOW_LIST_KEY}: {e}", reference.name)))
}

/// Metrics block with receiver defaults applied
pub async fn metrics(
    store: &dyn FleetStore,
    device: &EdgeDevice,
    set: Option<&EdgeDeviceSet>,
) -> Result<MetricsDescriptor, AssemblyError> {
    let namespace = device.metadata.namespace.as_deref().unwrap_or_default();
    let spec: Option<&MetricsConfiguration> = overlay(
        device.spec.metrics.as_ref(),
        set.and_then(|s| s.spec.metrics.as_ref()),
    );
    let Some(spec) = spec else {
        return Ok(MetricsDescriptor {
            retention: None,
            system: SystemMetricsDescriptor {
                interval: DEFAULT_SYSTEM_METRICS_INTERVAL,
                ..Default::default()
            },
            receiver: MetricsReceiverDescriptor::default(),
        });
    };

    let mut receiver = MetricsReceiverDescriptor::default();
    if let Some(cfg) = &spec.receiver_configuration {
        receiver.url = cfg.url.clone();
        if let Some(n) = cfg.request_num_samples {
            receiver.request_num_samples = n;
        }
        if let Some(t) = cfg.timeout_seconds {
            receiver.timeout_seconds = t;
        }
        let https = cfg.url.as_deref().is_some_and(|u| u.starts_with("https://"));
        if let (true, Some(ca)) = (https, cfg.ca_secret_name.as_deref()) {
            let s = secret(store, namespace, ca).await?;
            receiver.ca_cert = Some(secret_value(&s, CA_BUNDLE_KEY)?);
        }
    }

    let mut system = SystemMetricsDescriptor {
        interval: DEFAULT_SYSTEM_METRICS_INTERVAL,
        ..Default::default()
    };
    if let Some(cfg) = &spec.system_metrics {
        system.interval = cfg.interval.filter(|i| *i > 0).unwrap_or(DEFAULT_SYSTEM_METRICS_INTERVAL);
        system.disabled = cfg.disabled;
        if let Some(reference) = &cfg.allow_list {
            system.allow_list = Some(allow_list(store, namespace, reference).await?);
        }
    }

    Ok(MetricsDescriptor {
        retention: spec.retention.clone(),
        system,
        receiver,
    })
}

/// Log collectors, with syslog endpoints dereferenced
pub async fn log_collection(
    store: &dyn FleetStore,
    device: &EdgeDevice,
    set: Option<&EdgeDeviceSet>,
) -> Result<BTreeMap<String, LogCollectionDescriptor>, AssemblyError> {
    let namespace = device.metadata.namespace.as_deref().unwrap_or_default();
    let collectors: &BTreeMap<String, LogCollectionConfig> = match set {
        Some(s) if device.spec.log_collection.is_empty() => &s.spec.log_collection,
        _ => &device.spec.log_collection,
    };

    let mut out = BTreeMap::new();
    for (name, cfg) in collectors {
        let mut descriptor = LogCollectionDescriptor {
            kind: cfg.kind.clone(),
            buffer_size: cfg.buffer_size,
            syslog: None,
        };
        if cfg.kind == SYSLOG_KIND {
            if let Some(reference) = &cfg.syslog_config {
                descriptor.syslog = Some(syslog(store, namespace, &reference.name).await?);
            }
        }
        out.insert(name.clone(), descriptor);
    }
    Ok(out)
}

async fn syslog(store: &dyn FleetStore, namespace: &str, name: &str) -> Result<SyslogDescriptor, AssemblyError> {
    let cm = config_map(store, namespace, name).await?;
    let address = required_cm_value(&cm, "Address")?;
    let protocol = cm_value(&cm, "Protocol")
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_SYSLOG_PROTOCOL.to_string());
    if protocol != "tcp" && protocol != "udp" {
        return Err(config_error(format!(
            "configmap {namespace}/{name}: syslog protocol must be tcp or udp, got {protocol:?}"
        )));
    }
    Ok(SyslogDescriptor { address, protocol })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{
        EdgeDeviceSetSpec, MetricsReceiverConfiguration, S3StorageConfiguration, SystemMetricsConfiguration,
    };
    use fleet_store::MockFleetStore;
    use fleet_store::mock::fixtures::{config_map, device, secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn device_set(heartbeat_period: i64) -> EdgeDeviceSet {
        EdgeDeviceSet {
            metadata: ObjectMeta {
                name: Some("warehouse".into()),
                namespace: Some("edge".into()),
                ..Default::default()
            },
            spec: EdgeDeviceSetSpec {
                heartbeat: Some(HeartbeatConfiguration {
                    period_seconds: heartbeat_period,
                    hardware_profile: None,
                }),
                os_information: Some(OsInformation {
                    commit_id: Some("abc".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    fn bucket(store: &MockFleetStore, name: &str) {
        store.put_config_map(config_map(
            "edge",
            name,
            &[("BUCKET_HOST", "s3.local"), ("BUCKET_NAME", "edge-01"), ("BUCKET_PORT", "443")],
        ));
        store.put_secret(secret(
            "edge",
            name,
            &[("AWS_ACCESS_KEY_ID", "id"), ("AWS_SECRET_ACCESS_KEY", "key")],
        ));
    }

    #[test]
    fn test_heartbeat_overlay() {
        let mut d = device("edge", "edge-01", &[]);
        assert_eq!(heartbeat(&d, None), HeartbeatConfiguration::default());
        assert_eq!(heartbeat(&d, Some(&device_set(30))).period_seconds, 30);

        d.spec.heartbeat = Some(HeartbeatConfiguration {
            period_seconds: 10,
            hardware_profile: None,
        });
        assert_eq!(heartbeat(&d, Some(&device_set(30))).period_seconds, 10);
    }

    #[test]
    fn test_os_information_from_set() {
        let d = device("edge", "edge-01", &[]);
        assert!(os_information(&d, None).is_none());
        let os = os_information(&d, Some(&device_set(30))).unwrap();
        assert_eq!(os.commit_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_storage_from_bucket_claim() {
        let store = MockFleetStore::new();
        bucket(&store, "edge-01-obc");
        let mut d = device("edge", "edge-01", &[]);
        d.status.get_or_insert_with(Default::default).data_obc = Some("edge-01-obc".into());

        let s3 = storage(&store, &d, None).await.unwrap().unwrap().s3;
        assert_eq!(s3.bucket_host, "s3.local");
        assert_eq!(s3.bucket_port, 443);
        assert_eq!(s3.aws_access_key_id, "id");
    }

    #[tokio::test]
    async fn test_unprovisioned_claim_omits_storage() {
        let store = MockFleetStore::new();
        let mut d = device("edge", "edge-01", &[]);
        d.status.get_or_insert_with(Default::default).data_obc = Some("edge-01-obc".into());
        assert!(storage(&store, &d, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_external_storage_must_resolve() {
        let store = MockFleetStore::new();
        let mut d = device("edge", "edge-01", &[]);
        d.spec.storage = Some(StorageConfiguration {
            s3: Some(S3StorageConfiguration {
                secret_name: Some("s3-creds".into()),
                config_map_name: Some("s3-conf".into()),
                create_obc: false,
            }),
        });

        let err = storage(&store, &d, None).await.unwrap_err();
        assert!(matches!(err, AssemblyError::Configuration(_)));

        store.put_config_map(config_map("edge", "s3-conf", &[("BUCKET_HOST", "h"), ("BUCKET_NAME", "b"), ("BUCKET_PORT", "x")]));
        store.put_secret(secret("edge", "s3-creds", &[("AWS_ACCESS_KEY_ID", "id"), ("AWS_SECRET_ACCESS_KEY", "key")]));
        let err = storage(&store, &d, None).await.unwrap_err();
        assert!(matches!(err, AssemblyError::Configuration(m) if m.contains("BUCKET_PORT")));
    }

    #[tokio::test]
    async fn test_metrics_defaults() {
        let store = MockFleetStore::new();
        let d = device("edge", "edge-01", &[]);
        let m = metrics(&store, &d, None).await.unwrap();
        assert_eq!(m.system.interval, 60);
        assert_eq!(m.receiver.request_num_samples, 30_000);
        assert_eq!(m.receiver.timeout_seconds, 10);
    }

    #[tokio::test]
    async fn test_metrics_https_receiver_and_allow_list() {
        let store = MockFleetStore::new();
        store.put_secret(secret("edge", "receiver-ca", &[("ca.crt", "PEM")]));
        store.put_config_map(config_map("edge", "allow", &[("metrics_list.yaml", "names:\n  - node_cpu\n")]));
        let mut d = device("edge", "edge-01", &[]);
        d.spec.metrics = Some(MetricsConfiguration {
            retention: None,
            system_metrics: Some(SystemMetricsConfiguration {
                interval: Some(30),
                disabled: false,
                allow_list: Some(NameRef::new("allow")),
            }),
            receiver_configuration: Some(MetricsReceiverConfiguration {
                url: Some("https://metrics.local/write".into()),
                request_num_samples: Some(500),
                timeout_seconds: None,
                ca_secret_name: Some("receiver-ca".into()),
            }),
        });

        let m = metrics(&store, &d, None).await.unwrap();
        assert_eq!(m.system.interval, 30);
        assert_eq!(m.system.allow_list.unwrap().names, vec!["node_cpu"]);
        assert_eq!(m.receiver.request_num_samples, 500);
        assert_eq!(m.receiver.timeout_seconds, 10);
        assert_eq!(m.receiver.ca_cert.as_deref(), Some("PEM"));
    }

    #[tokio::test]
    async fn test_syslog_protocol_validation() {
        let store = MockFleetStore::new();
        store.put_config_map(config_map("edge", "syslog", &[("Address", "10.0.0.1:514")]));
        store.put_config_map(config_map("edge", "bad", &[("Address", "10.0.0.1:514"), ("Protocol", "quic")]));

        let mut d = device("edge", "edge-01", &[]);
        d.spec.log_collection.insert(
            "system".into(),
            LogCollectionConfig {
                kind: "syslog".into(),
                buffer_size: Some(10),
                syslog_config: Some(NameRef::new("syslog")),
            },
        );
        let logs = log_collection(&store, &d, None).await.unwrap();
        let syslog = logs["system"].syslog.as_ref().unwrap();
        assert_eq!(syslog.protocol, "tcp");
        assert_eq!(syslog.address, "10.0.0.1:514");

        d.spec.log_collection.get_mut("system").unwrap().syslog_config = Some(NameRef::new("bad"));
        let err = log_collection(&store, &d, None).await.unwrap_err();
        assert!(matches!(err, AssemblyError::Configuration(m) if m.contains("quic")));
    }
}
