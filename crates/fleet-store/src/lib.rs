//! EdgeFleet object store facade
//!
//! Typed access to the resources the gateway and the controllers share:
//! devices, workloads, signed requests, device sets, auto-configs, playbook
//! executions, Secrets and ConfigMaps.
//!
//! # Example
//!
//! ```no_run
//! use fleet_store::{FleetStore, KubeStore, LabelPatch};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = KubeStore::new(kube::Client::try_default().await?);
//!
//! if let Some(device) = store.get_device("edge", "edge-01").await? {
//!     let labels = LabelPatch::from([("tier".to_string(), Some("edge".to_string()))]);
//!     store.patch_device_labels(&device, &labels).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Optimistic concurrency**: every patch carries the pre-image's `resourceVersion`
//! - **Indexes**: `DeviceByWorkload` and `WorkloadByDevice` lookups
//! - **Events**: fire-and-forget Kubernetes events on any object
//! - **test-util**: `MockFleetStore` and `RecordingEventPublisher`

pub mod client;
pub mod error;
pub mod events;
pub mod patch;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeStore;
pub use error::StoreError;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher, object_ref};
#[cfg(any(test, feature = "test-util"))]
pub use events::{RecordedEvent, RecordingEventPublisher};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockFleetStore;
pub use patch::ObjectKey;
pub use store_trait::{FleetStore, LabelPatch};

/// Re-exported so callers can name event types without depending on kube directly
pub use kube::runtime::events::EventType;
