//! Reconciliation logic for Epgconf resources.
//!
//! An Epgconf opts its namespace in to a fabric Endpoint Group. For a live
//! object the reconciler persists the finalizer, then ensures:
//!
//! 1. the EPG `<namespace>_EPG` exists with its bridge and VMM domain bindings
//! 2. the namespace carries the `opflex.cisco.com/endpoint-group` annotation
//! 3. the EPG consumes every configured consumed contract
//! 4. the EPG provides every configured provided contract
//!
//! and records `Ready` or `Failed` in the status. Contracts are only ever
//! added: relations attached on the fabric side by hand are left alone.
//!
//! For an object being deleted it removes the EPG and the annotation, then
//! drops the finalizer so the API server can delete the object.

use crate::backoff::ExponentialBackoff;
use crate::cluster::ClusterClient;
use crate::config::CniConfig;
use crate::error::ControllerError;
use crate::metrics;
use apic_client::{ApicClientTrait, ApicError};
use crds::{Epgconf, EpgconfState};
use kube::ResourceExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Finalizer guarding fabric cleanup
pub const FINALIZER: &str = "epg.custom.config/finalizer";

/// Namespace annotation read by the opflex agent
pub const EPG_ANNOTATION: &str = "opflex.cisco.com/endpoint-group";

/// Value of the namespace annotation; field order is part of the format
#[derive(Debug, Serialize)]
struct EndpointGroupAnnotation<'a> {
    tenant: &'a str,
    #[serde(rename = "app-profile")]
    app_profile: &'a str,
    name: String,
}

/// Compact JSON annotation value for `namespace`
pub fn annotation_value(config: &CniConfig, namespace: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EndpointGroupAnnotation {
        tenant: &config.tenant,
        app_profile: &config.application_profile,
        name: CniConfig::epg_name(namespace),
    })
}

/// Desired contracts not yet attached, each once
fn missing_contracts<'a>(desired: &'a [String], actual: &[String]) -> Vec<&'a str> {
    let attached: HashSet<&str> = actual.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    desired
        .iter()
        .map(String::as_str)
        .filter(|contract| !attached.contains(contract) && seen.insert(*contract))
        .collect()
}

fn has_finalizer(epgconf: &Epgconf) -> bool {
    epgconf.finalizers().iter().any(|f| f == FINALIZER)
}

/// Run a call unless `cancel` fires first
async fn cancellable<T, E>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, ControllerError>
where
    E: Into<ControllerError>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ControllerError::Cancelled),
        result = call => result.map_err(Into::into),
    }
}

/// Backoff state for a resource
#[derive(Debug, Clone, Default)]
struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
}

impl BackoffState {
    fn increment_error(&mut self) -> Duration {
        self.error_count += 1;
        self.backoff.next_backoff()
    }
}

/// Reconciles Epgconf resources against the fabric.
pub struct Reconciler {
    apic: Box<dyn ApicClientTrait>,
    cluster: Box<dyn ClusterClient>,
    config: Arc<CniConfig>,
    /// Error count tracking per resource (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        apic: impl ApicClientTrait + 'static,
        cluster: impl ClusterClient + 'static,
        config: Arc<CniConfig>,
    ) -> Self {
        Self {
            apic: Box::new(apic),
            cluster: Box::new(cluster),
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Requeue delay after a failed reconcile of `key`
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.to_string()).or_default();
        let delay = state.increment_error();
        debug!("Backoff for {} after {} consecutive errors: {:?}", key, state.error_count, delay);
        delay
    }

    fn reset_backoff(&self, key: &str) {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Reconcile the Epgconf `namespace/name`
    ///
    /// Fabric and cluster calls stop early when `cancel` fires; a cancelled
    /// reconcile returns `ControllerError::Cancelled` without touching status.
    pub async fn reconcile(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let key = format!("{namespace}/{name}");
        info!("Reconciling Epgconf {}", key);
        metrics::increment_reconciliations();
        let started = Instant::now();

        let result = self.reconcile_epgconf(namespace, name, cancel).await;
        metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());

        match &result {
            Ok(()) => self.reset_backoff(&key),
            Err(e) if e.is_failure() => {
                metrics::increment_reconciliation_errors();
                error!("Reconciliation of Epgconf {} failed: {}", key, e);
            }
            Err(_) => info!("Reconciliation of Epgconf {} cancelled", key),
        }
        result
    }

    async fn reconcile_epgconf(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let Some(epgconf) = cancellable(cancel, self.cluster.get_epgconf(namespace, name)).await? else {
            debug!("Epgconf {}/{} no longer exists", namespace, name);
            return Ok(());
        };

        if epgconf.metadata.deletion_timestamp.is_some() {
            if !has_finalizer(&epgconf) {
                return Ok(());
            }
            self.finalize(namespace, cancel).await?;

            let mut updated = epgconf;
            updated.finalizers_mut().retain(|f| f != FINALIZER);
            cancellable(cancel, self.cluster.update_epgconf(&updated)).await?;
            info!("Cleaned up Epgconf {}/{}", namespace, name);
            return Ok(());
        }

        if !has_finalizer(&epgconf) {
            debug!("Adding finalizer to Epgconf {}/{}", namespace, name);
            let mut updated = epgconf;
            updated.finalizers_mut().push(FINALIZER.to_string());
            cancellable(cancel, self.cluster.update_epgconf(&updated)).await?;
        }

        match self.ensure(namespace, cancel).await {
            Ok(()) => {
                cancellable(cancel, self.cluster.update_status(namespace, name, EpgconfState::Ready)).await?;
                info!("Epgconf {}/{} is Ready", namespace, name);
                Ok(())
            }
            Err(ControllerError::Cancelled) => Err(ControllerError::Cancelled),
            Err(e) => {
                if let Err(status_err) =
                    cancellable(cancel, self.cluster.update_status(namespace, name, EpgconfState::Failed)).await
                {
                    error!("Failed to record Failed status on {}/{}: {}", namespace, name, status_err);
                }
                Err(e)
            }
        }
    }

    /// Fabric call under cancellation, counted per operation
    async fn fabric<T>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T, ApicError>>,
    ) -> Result<T, ControllerError> {
        metrics::increment_fabric_operations(operation);
        let result = cancellable(cancel, call).await;
        if matches!(result, Err(ControllerError::Apic(_))) {
            metrics::increment_fabric_operation_errors(operation);
        }
        result
    }

    async fn ensure(&self, namespace: &str, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let config = &self.config;
        let epg = CniConfig::epg_name(namespace);
        let (app, tenant) = (config.application_profile.as_str(), config.tenant.as_str());

        debug!("Ensuring EPG {} in {}/{}", epg, tenant, app);
        self.fabric(
            "create_epg",
            cancel,
            self.apic.create_epg(
                &epg,
                app,
                tenant,
                &config.bridge_domain,
                &config.vmm_domain,
                &config.vmm_domain_type,
            ),
        )
        .await?;

        let value = annotation_value(config, namespace)?;
        debug!("Annotating namespace {} with {}", namespace, value);
        cancellable(cancel, self.cluster.annotate_namespace(namespace, EPG_ANNOTATION, &value)).await?;

        let consumed = self
            .fabric("get_consumed_contracts", cancel, self.apic.get_consumed_contracts(&epg, app, tenant))
            .await?;
        for contract in missing_contracts(&config.consumed_contracts, &consumed) {
            debug!("EPG {} consumes {}", epg, contract);
            self.fabric("consume_contract", cancel, self.apic.consume_contract(&epg, app, tenant, contract))
                .await?;
        }

        let provided = self
            .fabric("get_provided_contracts", cancel, self.apic.get_provided_contracts(&epg, app, tenant))
            .await?;
        for contract in missing_contracts(&config.provided_contracts, &provided) {
            debug!("EPG {} provides {}", epg, contract);
            self.fabric("provide_contract", cancel, self.apic.provide_contract(&epg, app, tenant, contract))
                .await?;
        }

        Ok(())
    }

    async fn finalize(&self, namespace: &str, cancel: &CancellationToken) -> Result<(), ControllerError> {
        let epg = CniConfig::epg_name(namespace);
        let (app, tenant) = (self.config.application_profile.as_str(), self.config.tenant.as_str());

        debug!("Deleting EPG {} in {}/{}", epg, tenant, app);
        self.fabric("delete_epg", cancel, self.apic.delete_epg(&epg, app, tenant))
            .await?;

        // Namespaces deleted alongside the Epgconf, or Epgconfs removed before
        // their first ensure, have nothing to remove.
        let annotations = cancellable(cancel, self.cluster.namespace_annotations(namespace)).await?;
        if annotations.is_some_and(|a| a.contains_key(EPG_ANNOTATION)) {
            debug!("Removing {} from namespace {}", EPG_ANNOTATION, namespace);
            cancellable(cancel, self.cluster.remove_namespace_annotation(namespace, EPG_ANNOTATION)).await?;
        } else {
            debug!("Namespace {} carries no {} annotation", namespace, EPG_ANNOTATION);
        }
        Ok(())
    }
}
