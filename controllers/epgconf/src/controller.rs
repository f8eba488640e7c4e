//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires bootstrap, the
//! fabric and cluster clients, the health and metrics servers, leader
//! election and the Epgconf supervisor together.

use crate::bootstrap::{PASSWORD_ENV, bootstrap};
use crate::cli::{Cli, parse_bind_address};
use crate::cluster::KubeClusterClient;
use crate::error::ControllerError;
use crate::leader_election::LeaderElector;
use crate::metrics_auth::KubeMetricsAuthorizer;
use crate::reconciler::Reconciler;
use crate::server::{self, ServerState};
use crate::watcher::{self, Context};
use apic_client::ApicClient;
use crds::Epgconf;
use kube::{Api, Client};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_IDENTITY: &str = "epgconf-controller";

/// Main controller for Epgconf resources.
pub struct Controller {
    client: Client,
    reconciler: Arc<Reconciler>,
    cli: Cli,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("reconciler", &self.reconciler)
            .field("cli", &self.cli)
            .finish_non_exhaustive()
    }
}

/// Leader identity: the pod name, else the host name
fn leader_identity(pod_name: Option<String>, host_name: Option<String>) -> String {
    pod_name
        .or(host_name)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_IDENTITY.to_string())
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ControllerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Server(format!("failed to bind {addr}: {e}")))
}

impl Controller {
    /// Bootstraps the fabric configuration and connects to the APIC.
    pub async fn new(cli: Cli) -> Result<Self, ControllerError> {
        info!("Initializing Epgconf Controller");

        let client = Client::try_default().await?;
        let cluster = KubeClusterClient::new(client.clone());

        let config = bootstrap(&cluster, std::env::var(PASSWORD_ENV).ok()).await?;
        info!("Configuration:");
        info!("  APIC: {}", config.apic.host);
        info!("  Tenant: {}", config.tenant);
        info!("  Application profile: {}", config.application_profile);
        info!("  Bridge domain: {}", config.bridge_domain);
        info!("  VMM domain: {} ({})", config.vmm_domain, config.vmm_domain_type);

        let apic = ApicClient::connect(&config.apic).await.map_err(|e| {
            error!("Failed to connect to APIC {}: {}", config.apic.host, e);
            ControllerError::Apic(e)
        })?;
        info!("APIC connectivity established");

        let reconciler = Reconciler::new(apic, cluster, Arc::new(config));
        Ok(Self {
            client,
            reconciler: Arc::new(reconciler),
            cli,
        })
    }

    /// Serves probes and metrics and runs the supervisor until `shutdown`
    ///
    /// Returns an error when leadership is lost.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let state = Arc::new(ServerState::default());
        let servers = self.start_servers(&state, &shutdown).await?;
        // Bootstrap and APIC connectivity already succeeded in `new`
        state.is_ready.store(true, Ordering::Relaxed);

        let mut guard = None;
        if self.cli.leader_elect {
            let identity = leader_identity(std::env::var("POD_NAME").ok(), std::env::var("HOSTNAME").ok());
            let elector = Arc::new(LeaderElector::new(
                self.client.clone(),
                &self.cli.leader_election_namespace,
                &identity,
            ));
            guard = elector.acquire(&shutdown).await;
            if guard.is_none() {
                info!("Shut down before acquiring leadership");
                join_servers(servers).await;
                return Ok(());
            }
        }

        let lost = guard.as_ref().map(|g| g.lost()).unwrap_or_default();
        let root = shutdown.clone();
        let lost_signal = lost.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = lost_signal.cancelled() => root.cancel(),
                () = root.cancelled() => {}
            }
        });

        let ctx = Arc::new(Context {
            reconciler: self.reconciler.clone(),
            shutdown: shutdown.clone(),
        });
        let result = watcher::run(Api::<Epgconf>::all(self.client.clone()), ctx, self.cli.concurrency).await;
        state.is_ready.store(false, Ordering::Relaxed);
        // The supervisor only returns early on its own failure
        shutdown.cancel();

        if lost.is_cancelled() {
            join_servers(servers).await;
            return Err(ControllerError::LeaderElection("leadership lost".to_string()));
        }
        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                warn!("Failed to release leader lease: {}", e);
            }
        }

        join_servers(servers).await;
        info!("Epgconf Controller stopped");
        result
    }

    async fn start_servers(
        &self,
        state: &Arc<ServerState>,
        shutdown: &CancellationToken,
    ) -> Result<Vec<JoinHandle<Result<(), ControllerError>>>, ControllerError> {
        let mut servers = Vec::new();

        if let Some(addr) = parse_bind_address(&self.cli.health_probe_bind_address)? {
            let listener = bind(addr).await?;
            servers.push(tokio::spawn(server::serve(
                listener,
                server::probe_router(state.clone()),
                shutdown.clone(),
            )));
        }

        match parse_bind_address(&self.cli.metrics_bind_address)? {
            None => info!("Metrics endpoint disabled"),
            Some(addr) if self.cli.metrics_secure => {
                let tls = server::tls_config(self.cli.enable_http2)?;
                let listener = bind(addr).await?;
                let authorizer = Arc::new(KubeMetricsAuthorizer::new(self.client.clone()));
                servers.push(tokio::spawn(server::serve_tls(
                    listener,
                    server::secure_metrics_router(authorizer),
                    tls,
                    self.cli.enable_http2,
                    shutdown.clone(),
                )));
            }
            Some(addr) => {
                let listener = bind(addr).await?;
                servers.push(tokio::spawn(server::serve(listener, server::metrics_router(), shutdown.clone())));
            }
        }

        Ok(servers)
    }
}

async fn join_servers(servers: Vec<JoinHandle<Result<(), ControllerError>>>) {
    for handle in servers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Server failed: {}", e),
            Err(e) => error!("Server task panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockClusterClient, test_config, unresponsive_kube_client};
    use apic_client::MockApicClient;
    use clap::Parser;
    use std::time::Duration;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_ready_while_waiting_for_leadership() {
        let (client, _api) = unresponsive_kube_client().await;
        let probe = format!("127.0.0.1:{}", free_port().await);
        let controller = Controller {
            client,
            reconciler: Arc::new(Reconciler::new(
                MockApicClient::new(),
                MockClusterClient::new(),
                Arc::new(test_config()),
            )),
            cli: Cli::parse_from([
                "epgconf-controller",
                "--leader-elect",
                "--health-probe-bind-address",
                &probe,
            ]),
        };
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(controller.run(shutdown.clone()));

        // The lease request never completes, yet the replica reports ready
        let url = format!("http://{probe}/readyz");
        let mut status = None;
        for _ in 0..50 {
            if let Ok(response) = reqwest::get(&url).await {
                status = Some(response.status());
                if response.status().is_success() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, Some(reqwest::StatusCode::OK));
        assert!(!running.is_finished());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_leader_identity_prefers_pod_name() {
        assert_eq!(
            leader_identity(Some("epg-0".to_string()), Some("node-1".to_string())),
            "epg-0"
        );
        assert_eq!(leader_identity(None, Some("node-1".to_string())), "node-1");
        assert_eq!(leader_identity(None, None), DEFAULT_IDENTITY);
        assert_eq!(leader_identity(Some(String::new()), None), DEFAULT_IDENTITY);
    }
}
