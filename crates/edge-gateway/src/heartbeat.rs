//! Heartbeat ingestion
//!
//! A heartbeat is merged into the device status and hardware labels under
//! the linear retry policy. Agent events are forwarded only on the first
//! attempt so a retried heartbeat never duplicates them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crds::labels::{HARDWARE_LABEL_PREFIX, hardware_labels};
use crds::{
    EdgeDevice, EdgeDeviceStatus, PlaybookExecutionStatusEntry, UpgradeInformation, WorkloadPhase,
};
use fleet_store::events::{actions, reasons};
use fleet_store::{EventType, FleetStore, LabelPatch, object_ref};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::models::{Heartbeat, UpgradeReport, WorkloadReport};
use crate::retry::{RetryPolicy, retry};
use crate::state::AppState;

/// Parse an agent-reported phase, tolerating case and unknown values
pub fn parse_phase(raw: &str) -> WorkloadPhase {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).unwrap_or(WorkloadPhase::Unknown)
}

/// Device status after applying `heartbeat` at `now`
pub fn merge_status(current: &EdgeDeviceStatus, heartbeat: &Heartbeat, now: DateTime<Utc>) -> EdgeDeviceStatus {
    let mut status = current.clone();
    status.last_synced_resource_version = Some(heartbeat.version.clone());
    status.phase = Some(heartbeat.status.clone());
    if let Some(hw) = &heartbeat.hardware {
        status.hardware = Some(hw.clone());
    }
    if let Some(upgrade) = &heartbeat.upgrade {
        status.upgrade_information = Some(upgrade_information(upgrade));
    }
    merge_workloads(&mut status, &heartbeat.workloads, now);
    merge_playbook_executions(&mut status.playbook_executions, &heartbeat.playbook_executions);
    status
}

fn upgrade_information(report: &UpgradeReport) -> UpgradeInformation {
    UpgradeInformation {
        current_commit_id: report.current_commit_id.clone(),
        last_upgrade_status: report.last_upgrade_status.clone(),
        last_upgrade_time: report.last_upgrade_time.clone(),
    }
}

// Only workloads the device is bound to are tracked; reports for anything
// else are stale agent state and ignored.
fn merge_workloads(status: &mut EdgeDeviceStatus, reports: &[WorkloadReport], now: DateTime<Utc>) {
    for report in reports {
        let Some(entry) = status.workloads.iter_mut().find(|w| w.name == report.name) else {
            continue;
        };
        let phase = parse_phase(&report.status);
        if entry.phase != phase {
            entry.phase = phase;
            entry.last_transition_time = Some(now);
        }
        entry.last_data_upload = report.last_data_upload;
    }
}

fn merge_playbook_executions(
    current: &mut Vec<PlaybookExecutionStatusEntry>,
    reported: &[PlaybookExecutionStatusEntry],
) {
    for report in reported {
        match current.iter_mut().find(|p| p.name == report.name) {
            Some(entry) => entry.conditions = report.conditions.clone(),
            None => current.push(report.clone()),
        }
    }
}

/// Label changes that bring `labels` in line with the hardware fingerprint
///
/// Stale `device.*` labels are removed. Returns an empty patch when
/// nothing changes.
pub fn hardware_label_patch(labels: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> LabelPatch {
    let mut patch = LabelPatch::new();
    for (key, value) in desired {
        if labels.get(key) != Some(value) {
            patch.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in labels.keys() {
        if key.starts_with(HARDWARE_LABEL_PREFIX) && !desired.contains_key(key) {
            patch.insert(key.clone(), None);
        }
    }
    patch
}

async fn publish_events(state: &AppState, device: &EdgeDevice, heartbeat: &Heartbeat) {
    let reference = object_ref(device);
    for event in &heartbeat.events {
        let type_ = if event.is_warning() {
            EventType::Warning
        } else {
            EventType::Normal
        };
        let reason = if event.reason.is_empty() {
            reasons::DEVICE_EVENT
        } else {
            event.reason.as_str()
        };
        state
            .events
            .publish(&reference, type_, reason, actions::HEARTBEAT, Some(event.message.clone()))
            .await;
    }
}

async fn apply_heartbeat(
    state: &AppState,
    store: &dyn FleetStore,
    namespace: &str,
    name: &str,
    heartbeat: &Heartbeat,
    attempt: u32,
) -> Result<()> {
    let Some(device) = store.get_device(namespace, name).await? else {
        state.metrics.device_not_found.inc();
        return Err(GatewayError::NotFound(format!("device {namespace}/{name}")));
    };

    if attempt == 0 {
        publish_events(state, &device, heartbeat).await;
    }

    let current = device.status.clone().unwrap_or_default();
    let merged = merge_status(&current, heartbeat, Utc::now());
    let device = if merged == current {
        debug!("Status of {}/{} unchanged", namespace, name);
        device
    } else {
        store.patch_device_status(&device, &merged).await?
    };

    if let Some(hw) = &heartbeat.hardware {
        let labels = device.metadata.labels.clone().unwrap_or_default();
        let patch = hardware_label_patch(&labels, &hardware_labels(hw));
        if !patch.is_empty() {
            store.patch_device_labels(&device, &patch).await?;
        }
    }
    Ok(())
}

/// Merge a heartbeat into the device `namespace/name`
pub async fn process_heartbeat(state: &AppState, namespace: &str, name: &str, heartbeat: &Heartbeat) -> Result<()> {
    let store = state.store.as_ref();
    retry(
        RetryPolicy::HEARTBEAT,
        |e: &GatewayError| matches!(e, GatewayError::Store(s) if s.is_transient()),
        |attempt| async move { apply_heartbeat(state, store, namespace, name, heartbeat, attempt).await },
    )
    .await?;

    state.metrics.heartbeats.inc();
    info!(phase = %heartbeat.status, "Heartbeat from {}/{}", namespace, name);
    Ok(())
}
