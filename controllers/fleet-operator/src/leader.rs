//! Leader election using Kubernetes Leases
//!
//! Only the holder of the `coordination.k8s.io/v1` Lease runs the
//! controllers and the gateway. Updates carry the lease's resourceVersion,
//! so two replicas racing for an expired lease cannot both win: the loser
//! gets a 409 and keeps waiting.

use std::sync::Arc;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lease name shared by every operator replica
pub const LEADER_LEASE_NAME: &str = "edgefleet-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const FIELD_MANAGER: &str = "edgefleet-operator";

/// Identity of this replica: the pod name when running in a pod
pub fn identity() -> String {
    std::env::var("POD_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("fleet-operator-{}", uuid::Uuid::new_v4()))
}

/// Returns true once `renew_time + duration` lies before `now`
fn is_expired(spec: Option<&LeaseSpec>, now: Timestamp) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration) {
        (Some(rt), Some(secs)) => rt
            .0
            .checked_add(SignedDuration::from_secs(i64::from(secs)))
            .map_or(true, |deadline| now > deadline),
        _ => true,
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

/// Leader elector over a namespaced Lease
pub struct LeaderElector {
    client: Client,
    namespace: String,
    identity: String,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("namespace", &self.namespace)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Create an elector for the lease in `namespace`
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn spec(&self, now: Timestamp, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// Block until leadership is acquired
    ///
    /// The returned guard renews the lease in the background.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!("Waiting for leadership of lease {}/{} as {}", self.namespace, LEADER_LEASE_NAME, self.identity);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Leadership acquired by {}", self.identity);
                    return self.guard();
                }
                Ok(false) => debug!("Lease held by another replica, waiting"),
                Err(e) => warn!("Failed to acquire lease, retrying: {}", e),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move { elector.renewal_loop(lost_tx).await });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Create, renew or take over the lease; false if another replica holds it
    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let api = self.api();
        let now = Timestamp::now();

        let Some(lease) = api.get_opt(LEADER_LEASE_NAME).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEADER_LEASE_NAME.to_string()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.spec(now, 0)),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(e) if is_conflict(&e) => Ok(false),
                Err(e) => Err(e),
            };
        };

        let spec = lease.spec.as_ref();
        let mut updated = lease.clone();
        if spec.and_then(|s| s.holder_identity.as_ref()) == Some(&self.identity) {
            if let Some(spec) = updated.spec.as_mut() {
                spec.renew_time = Some(MicroTime(now));
            }
        } else if is_expired(spec, now) {
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            updated.spec = Some(self.spec(now, transitions + 1));
            info!("Taking over expired lease (transition {})", transitions + 1);
        } else {
            return Ok(false);
        }

        // Carries the read resourceVersion: a concurrent writer makes this 409
        match api.replace(LEADER_LEASE_NAME, &PostParams::default(), &updated).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => debug!("Lease renewed"),
                Ok(false) | Err(_) => {
                    warn!("Leadership lost by {}", self.identity);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby replica takes over without waiting
    async fn release(&self) -> Result<(), kube::Error> {
        let api = self.api();
        let Some(lease) = api.get_opt(LEADER_LEASE_NAME).await? else {
            return Ok(());
        };
        if lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref()) != Some(&self.identity) {
            return Ok(());
        }

        let past = Timestamp::now() - SignedDuration::from_secs(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_string()
            }
        });
        api.patch(LEADER_LEASE_NAME, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        info!("Lease released by {}", self.identity);
        Ok(())
    }
}

/// Held while this replica leads
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl std::fmt::Debug for LeaderGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderGuard").field("elector", &self.elector).finish_non_exhaustive()
    }
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Give up leadership during graceful shutdown
    pub async fn release(&self) {
        self.renewal_task.abort();
        if let Err(e) = self.elector.release().await {
            warn!("Failed to release lease: {}", e);
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
