//! Kubernetes Event recording
//!
//! Trait-based wrapper over `kube::runtime::events::Recorder` so the gateway
//! and the controllers can attach events to devices and workloads.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! the caller.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

/// Reference to `obj` suitable as an event target
pub fn object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    obj.object_ref(&())
}

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    /// The component name appears as `reportingComponent` on events
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event captured by [`RecordingEventPublisher`]
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// Publisher that keeps every event in memory, for assertions in tests
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default, Clone)]
pub struct RecordingEventPublisher {
    events: std::sync::Arc<std::sync::Mutex<Vec<RecordedEvent>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingEventPublisher {
    /// Snapshot of the events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Warning events only
    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|e| e.warning).collect()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        let object = format!(
            "{}/{}",
            resource_ref.namespace.as_deref().unwrap_or_default(),
            resource_ref.name.as_deref().unwrap_or_default()
        );
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedEvent {
                object,
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
    }
}

/// Well-known event reason strings
pub mod reasons {
    /// A mandatory reference in the device configuration could not be resolved
    pub const CONFIGURATION_FAILED: &str = "ConfigurationFailed";
    /// Event forwarded from a device heartbeat
    pub const DEVICE_EVENT: &str = "DeviceEvent";
    /// Device completed registration
    pub const REGISTERED: &str = "Registered";
    /// Signed request approved and device created
    pub const APPROVED: &str = "Approved";
    /// Workload bound to a device
    pub const WORKLOAD_BOUND: &str = "WorkloadBound";
    /// Workload removed from a device
    pub const WORKLOAD_UNBOUND: &str = "WorkloadUnbound";
}

/// Well-known event action strings
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const ASSEMBLE: &str = "AssembleConfiguration";
    pub const HEARTBEAT: &str = "Heartbeat";
    pub const REGISTER: &str = "Register";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_publisher_captures_events() {
        let publisher = RecordingEventPublisher::default();
        let obj_ref = ObjectReference {
            name: Some("edge-01".into()),
            namespace: Some("edge".into()),
            ..Default::default()
        };
        publisher
            .publish(&obj_ref, EventType::Warning, reasons::CONFIGURATION_FAILED, actions::ASSEMBLE, Some("missing secret".into()))
            .await;
        publisher
            .publish(&obj_ref, EventType::Normal, reasons::DEVICE_EVENT, actions::HEARTBEAT, None)
            .await;

        assert_eq!(publisher.events().len(), 2);
        let warnings = publisher.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].object, "edge/edge-01");
        assert_eq!(warnings[0].reason, "ConfigurationFailed");
    }

    #[tokio::test]
    async fn test_noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(&ObjectReference::default(), EventType::Normal, reasons::REGISTERED, actions::REGISTER, None)
            .await;
    }
}
