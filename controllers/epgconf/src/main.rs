//! Epgconf Controller
//!
//! Keeps an ACI Endpoint Group for every namespace holding an `Epgconf`:
//! - creates `<namespace>_EPG` bound to the cluster's bridge and VMM domains
//! - annotates the namespace so the opflex agent places its pods in the EPG
//! - attaches the default provided and consumed contracts
//! - removes the EPG and the annotation when the `Epgconf` is deleted
//!
//! Configuration is read once at startup from the ACI CNI's own ConfigMaps
//! in `aci-containers-system`.

mod backoff;
mod bootstrap;
mod cli;
mod cluster;
mod config;
mod controller;
mod error;
mod leader_election;
mod metrics;
mod metrics_auth;
mod reconciler;
mod server;
mod watcher;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use cli::Cli;
use controller::Controller;
use error::ControllerError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // Process-wide rustls provider (ring)
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    info!("Starting Epgconf Controller v{}", env!("CARGO_PKG_VERSION"));

    metrics::register_metrics().map_err(|e| ControllerError::Server(format!("failed to register metrics: {e}")))?;

    let controller = Controller::new(cli).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    controller.run(shutdown).await
}
