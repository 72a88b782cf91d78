//! Leader election using Kubernetes Leases
//!
//! Several operator replicas may run at once; only the lease holder runs the
//! reconcilers. The lease is read, decided on and written back with the
//! resourceVersion it was read at, so two replicas racing for an expired
//! lease cannot both win: the loser's write fails with 409 Conflict.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::FIELD_MANAGER;

/// Lease name shared by all operator replicas
pub const LEADER_LEASE_NAME: &str = "capvirt-controller-manager";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The stored lease cannot be compared-and-swapped
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with the lease as observed at one point in time
#[derive(Debug, PartialEq, Eq)]
enum LeaseDecision {
    /// No lease exists yet
    Create,
    /// We hold it
    Renew,
    /// Someone else held it and let it expire
    TakeOver {
        /// Transition count of the expired lease
        transitions: i32,
    },
    /// Someone else holds it
    Wait,
}

fn decide(lease: Option<&Lease>, identity: &str, now: chrono::DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseDecision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    };
    let vacant = spec.and_then(|s| s.holder_identity.as_deref()).is_none();

    if expired || vacant {
        LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseDecision::Wait
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until leadership is acquired, then return a guard
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = RETRY_INTERVAL.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = RETRY_INTERVAL.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        match (decide(existing.as_ref(), &self.identity, now), existing) {
            (LeaseDecision::Create, _) => self.write(&api, None, now, 0, true).await,
            (LeaseDecision::Renew, Some(lease)) => {
                let mut renewed = lease.clone();
                if let Some(spec) = renewed.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.replace(&api, &renewed).await
            }
            (LeaseDecision::TakeOver { transitions }, Some(lease)) => {
                let rv = lease
                    .metadata
                    .resource_version
                    .clone()
                    .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;
                let taken = self.write(&api, Some(rv), now, transitions + 1, false).await?;
                if taken {
                    info!(identity = %self.identity, transitions = transitions + 1, "Took over expired lease");
                }
                Ok(taken)
            }
            _ => Ok(false),
        }
    }

    fn lease(&self, resource_version: Option<String>, now: chrono::DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn write(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
        create: bool,
    ) -> Result<bool, LeaderElectionError> {
        let lease = self.lease(resource_version, now, transitions);
        if create {
            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!(identity = %self.identity, "Created new lease");
                    Ok(true)
                }
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            }
        } else {
            self.replace(api, &lease).await
        }
    }

    async fn replace(&self, api: &Api<Lease>, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match api.replace(&self.lease_name, &PostParams::default(), lease).await {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease written");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease changed underneath us");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby replica can take over without waiting
    /// for the lease to expire
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": { "holderIdentity": null }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership during graceful shutdown
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
