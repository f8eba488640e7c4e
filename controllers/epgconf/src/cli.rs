//! Command-line flags.

use crate::bootstrap::SYSTEM_NAMESPACE;
use crate::error::ControllerError;
use clap::{ArgAction, Parser};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

/// Keeps an ACI Endpoint Group for every namespace holding an Epgconf
#[derive(Debug, Parser)]
#[command(name = "epgconf-controller", version, about)]
pub struct Cli {
    /// Metrics endpoint address: `0` disables it, `:8443` for HTTPS, `:8080` for HTTP
    #[arg(long, default_value = "0")]
    pub metrics_bind_address: String,

    /// Health probe endpoint address
    #[arg(long, default_value = ":8081")]
    pub health_probe_bind_address: String,

    /// Run the supervisor only while holding the leader Lease
    #[arg(long, num_args = 0..=1, default_value_t = false, default_missing_value = "true", action = ArgAction::Set)]
    pub leader_elect: bool,

    /// Serve metrics over HTTPS
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    pub metrics_secure: bool,

    /// Offer HTTP/2 on the metrics endpoint (off unless asked for)
    #[arg(long, num_args = 0..=1, default_value_t = false, default_missing_value = "true", action = ArgAction::Set)]
    pub enable_http2: bool,

    /// Namespace holding the leader Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = SYSTEM_NAMESPACE)]
    pub leader_election_namespace: String,

    /// Maximum concurrent reconciles across distinct objects
    #[arg(long, default_value_t = 3)]
    pub concurrency: u16,
}

/// Resolve a bind address flag
///
/// `0` means disabled, `:port` binds all interfaces.
pub fn parse_bind_address(value: &str) -> Result<Option<SocketAddr>, ControllerError> {
    let value = value.trim();
    if value.is_empty() || value == "0" {
        return Ok(None);
    }

    let invalid = || ControllerError::InvalidConfig(format!("invalid bind address '{value}'"));
    if let Some(port) = value.strip_prefix(':') {
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        return Ok(Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))));
    }

    value
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .map(Some)
        .ok_or_else(invalid)
}
