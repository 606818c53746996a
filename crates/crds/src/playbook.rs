//! Playbook and PlaybookExecution CRDs
//!
//! A `Playbook` holds a remote-execution document; a `PlaybookExecution`
//! schedules it on one device (label `edgefleet/device=<name>`). The agent
//! reports progress through heartbeats into the device's
//! `status.playbookExecutions`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::edge_device::PlaybookExecutionCondition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "Playbook",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookSpec {
    /// Playbook document
    pub content: String,

    /// Seconds the agent may spend on one run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "management.edgefleet.io",
    version = "v1alpha1",
    kind = "PlaybookExecution",
    namespaced,
    status = "PlaybookExecutionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookExecutionSpec {
    /// Playbook to run, resolved at the time the execution was created
    pub playbook: PlaybookSpec,

    /// Number of times the agent has attempted this execution
    #[serde(default)]
    pub execution_attempts: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookExecutionStatus {
    #[serde(default)]
    pub conditions: Vec<PlaybookExecutionCondition>,
}

/// Condition types that end an execution
pub const TERMINAL_PLAYBOOK_CONDITIONS: &[&str] = &["Completed", "Failed"];

impl PlaybookExecution {
    /// Returns true once the execution reached a terminal condition
    pub fn is_finished(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions.iter().any(|c| {
                c.status == "True" && TERMINAL_PLAYBOOK_CONDITIONS.contains(&c.type_.as_str())
            })
        })
    }
}
