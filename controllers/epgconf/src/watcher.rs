//! Epgconf supervisor.
//!
//! Drives the reconciler from a `kube_runtime::Controller`: objects are
//! reconciled one at a time per key, distinct keys run concurrently up to
//! the configured limit, and failed keys are requeued with per-key backoff.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::Epgconf;
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{self, Action, Config as ControllerConfig};
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shared state handed to every reconcile
#[derive(Debug)]
pub struct Context {
    /// Reconciler shared by all workers
    pub reconciler: Arc<Reconciler>,
    /// Root shutdown token; each reconcile runs under a child of it
    pub shutdown: CancellationToken,
}

/// `namespace/name` key of an Epgconf
fn object_key(obj: &Epgconf) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

async fn reconcile(obj: Arc<Epgconf>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let namespace = obj
        .namespace()
        .ok_or_else(|| ControllerError::Watch(format!("Epgconf {} has no namespace", obj.name_any())))?;
    ctx.reconciler
        .reconcile(&namespace, &obj.name_any(), &ctx.shutdown.child_token())
        .await?;
    Ok(Action::await_change())
}

fn error_policy(obj: Arc<Epgconf>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = object_key(&obj);
    let delay = ctx.reconciler.next_backoff(&key);
    debug!("Requeueing Epgconf {} in {:?} after error: {}", key, delay, error);
    Action::requeue(delay)
}

/// Run the supervisor until `ctx.shutdown` fires
///
/// In-flight reconciles finish (or observe cancellation) before this returns.
pub async fn run(api: Api<Epgconf>, ctx: Arc<Context>, concurrency: u16) -> Result<(), ControllerError> {
    info!("Starting Epgconf supervisor (concurrency {})", concurrency);
    let shutdown = ctx.shutdown.clone();

    Controller::new(api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled Epgconf {}", obj.name),
                Err(controller::Error::ReconcilerFailed(e, obj)) if !e.is_failure() => {
                    debug!("Reconcile of Epgconf {} cancelled", obj.name);
                }
                Err(e) => error!("Epgconf controller error: {}", e),
            }
        })
        .await;

    info!("Epgconf supervisor stopped");
    Ok(())
}
