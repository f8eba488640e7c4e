//! Leader election using Kubernetes Leases
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the
//! supervisor.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we retry.
//! This prevents two replicas from both believing they hold leadership.

use crate::error::ControllerError;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease name shared by all operator replicas
pub const LEADER_LEASE_NAME: &str = "327369c9.custom.aci";

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);
const FIELD_MANAGER: &str = "epgconf-controller";

/// `MicroTime` from a chrono timestamp, via its RFC 3339 wire form
fn micro_time(at: DateTime<Utc>) -> Result<MicroTime, ControllerError> {
    Ok(serde_json::from_value(Value::String(
        at.to_rfc3339_opts(SecondsFormat::Micros, true),
    ))?)
}

/// chrono timestamp of a `MicroTime`
fn parse_micro_time(time: &MicroTime) -> Option<DateTime<Utc>> {
    let Value::String(raw) = serde_json::to_value(time).ok()? else {
        return None;
    };
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// True when the lease has no live holder at `now`
fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref()).and_then(parse_micro_time);
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(renewed), Some(duration)) => now > renewed + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    }
}

fn missing_resource_version() -> ControllerError {
    ControllerError::LeaderElection("lease missing resourceVersion".to_string())
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease_name", &self.lease_name)
            .field("namespace", &self.namespace)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Create a new leader elector with default timing (15s lease, 5s renew, 2s retry)
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: LEADER_LEASE_NAME.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Block until leadership is acquired or `shutdown` fires
    ///
    /// Returns `None` when shut down before acquiring. The guard renews the
    /// lease in the background; its `lost()` token fires if renewal fails.
    pub async fn acquire(self: Arc<Self>, shutdown: &CancellationToken) -> Option<LeaderGuard> {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership...");

        loop {
            let attempt = tokio::select! {
                () = shutdown.cancelled() => return None,
                attempt = self.try_acquire_or_renew() => attempt,
            };
            match attempt {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return Some(self.create_guard());
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    // Transient errors shouldn't stop us
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying...");
                }
            }
            tokio::select! {
                () = shutdown.cancelled() => return None,
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let lost = CancellationToken::new();
        let elector = Arc::clone(self);
        let lost_signal = lost.clone();
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_signal).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost,
        }
    }

    /// Try to acquire or renew the lease atomically
    async fn try_acquire_or_renew(&self) -> Result<bool, ControllerError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return self.create_lease(&api, now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());

        if holder == Some(self.identity.as_str()) {
            return self.renew_lease(&api, &lease, now).await;
        }

        if holder.is_none() || lease_expired(spec, now) {
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            self.take_over_lease(&api, lease.metadata.resource_version.clone(), now, transitions)
                .await
        } else {
            Ok(false)
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> Result<LeaseSpec, ControllerError> {
        let now = micro_time(now)?;
        Ok(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: i32::try_from(self.lease_duration.as_secs()).ok(),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        })
    }

    /// Create a new lease (first leader)
    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool, ControllerError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)?),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew a lease we hold (atomic with resourceVersion)
    async fn renew_lease(&self, api: &Api<Lease>, existing: &Lease, now: DateTime<Utc>) -> Result<bool, ControllerError> {
        if existing.metadata.resource_version.is_none() {
            return Err(missing_resource_version());
        }

        let mut updated = existing.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(micro_time(now)?);
        }

        match api.replace(&self.lease_name, &PostParams::default(), &updated).await {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(identity = %self.identity, "Lease renewal conflict - lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take over an expired or released lease (atomic with resourceVersion)
    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, ControllerError> {
        let resource_version = resource_version.ok_or_else(missing_resource_version)?;
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(resource_version),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, transitions + 1)?),
        };

        match api.replace(&self.lease_name, &PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, transitions = transitions + 1, "Took over expired lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renewal loop that runs while we hold leadership
    async fn renewal_loop(&self, lost: CancellationToken) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    lost.cancel();
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed - leadership lost");
                    lost.cancel();
                    return;
                }
            }
        }
    }

    /// Release the lease by clearing the holder identity
    ///
    /// Lets a standby replica take over without waiting for expiry.
    async fn release_lease(&self) -> Result<(), ControllerError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339_opts(SecondsFormat::Micros, true)
            }
        });

        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(&self.lease_name, &params, &Patch::Merge(&patch))
            .await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
#[derive(Debug)]
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost: CancellationToken,
}

impl LeaderGuard {
    /// Token cancelled when leadership is lost
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Stop renewing and hand the lease back (call during graceful shutdown)
    pub async fn release(self) -> Result<(), ControllerError> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed: DateTime<Utc>, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(duration),
            renew_time: Some(micro_time(renewed).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_micro_time_round_trip_precision() {
        let now = Utc::now();
        let parsed = parse_micro_time(&micro_time(now).unwrap()).unwrap();
        assert!((parsed - now).num_milliseconds().abs() < 1);
    }

    #[test]
    fn test_live_lease_is_not_expired() {
        let now = Utc::now();
        assert!(!lease_expired(Some(&spec(now - chrono::Duration::seconds(5), 15)), now));
    }

    #[test]
    fn test_stale_lease_is_expired() {
        let now = Utc::now();
        assert!(lease_expired(Some(&spec(now - chrono::Duration::seconds(20), 15)), now));
    }

    #[test]
    fn test_lease_without_timing_is_expired() {
        assert!(lease_expired(None, Utc::now()));
        assert!(lease_expired(Some(&LeaseSpec::default()), Utc::now()));
    }

    #[tokio::test]
    async fn test_acquire_returns_on_shutdown_while_api_hangs() {
        let (client, _api) = crate::test_utils::unresponsive_kube_client().await;
        let elector = Arc::new(LeaderElector::new(client, "aci-containers-system", "epg-0"));
        let shutdown = CancellationToken::new();

        let pending = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { elector.acquire(&shutdown).await.is_some() }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let acquired = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(!acquired);
    }
}
