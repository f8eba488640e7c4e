//! One-shot startup configuration.
//!
//! Assembles the `CniConfig` from the ACI CNI's own configuration in
//! `aci-containers-system`:
//! - `aci-containers-config`, key `controller-config`: APIC host, user,
//!   tenant, bridge domain, VMM domain and application profile.
//! - `default-epg-contracts`, keys `provided` and `consumed`: JSON arrays of
//!   contract names.
//! - The APIC private key, read from the ACI controller pod by exec. When no
//!   such pod exists the password from `APIC_PASSWORD` is used instead.

use crate::config::CniConfig;
use crate::error::ControllerError;
use apic_client::{ApicAuth, ApicConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Namespace holding the ACI CNI configuration
pub const SYSTEM_NAMESPACE: &str = "aci-containers-system";
/// ConfigMap with the CNI controller configuration
pub const CONTROLLER_CONFIG_MAP: &str = "aci-containers-config";
/// Key of the controller configuration document
pub const CONTROLLER_CONFIG_KEY: &str = "controller-config";
/// ConfigMap with the default contracts
pub const CONTRACTS_CONFIG_MAP: &str = "default-epg-contracts";
/// Environment variable holding the fallback APIC password
pub const PASSWORD_ENV: &str = "APIC_PASSWORD";

/// Substring identifying the ACI controller pod
const CONTROLLER_POD_MARKER: &str = "controller";

/// Read access to cluster objects needed at startup
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    /// Data of a ConfigMap; `None` when it does not exist
    async fn config_map_data(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>, ControllerError>;

    /// Names of the pods in `namespace`
    async fn pod_names(&self, namespace: &str) -> Result<Vec<String>, ControllerError>;

    /// Run `command` in `pod` and return its standard output
    async fn exec(&self, namespace: &str, pod: &str, command: &[&str]) -> Result<String, ControllerError>;
}

/// Fields of `controller-config` the operator uses
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ControllerConfig {
    apic_hosts: Option<Vec<String>>,
    apic_username: Option<String>,
    apic_private_key_path: Option<String>,
    aci_policy_tenant: Option<String>,
    aci_podbd_dn: Option<String>,
    aci_vmm_domain: Option<String>,
    aci_vmm_type: Option<String>,
    app_profile: Option<String>,
}

fn required(value: Option<String>, key: &str) -> Result<String, ControllerError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{CONTROLLER_CONFIG_KEY} is missing {key}")))
}

/// Bridge domain name from a pod BD DN (`uni/tn-<t>/BD-<name>`)
pub fn bridge_domain_from_dn(dn: &str) -> Result<String, ControllerError> {
    dn.split('/')
        .nth(2)
        .map(|rn| rn.replace("BD-", ""))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ControllerError::InvalidConfig(format!("aci-podbd-dn {dn:?} has no bridge domain")))
}

fn contract_list(data: &BTreeMap<String, String>, key: &str) -> Result<Vec<String>, ControllerError> {
    match data.get(key) {
        None => Ok(Vec::new()),
        Some(raw) if raw.trim().is_empty() => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            ControllerError::InvalidConfig(format!("{CONTRACTS_CONFIG_MAP}/{key} is not a JSON string array: {e}"))
        }),
    }
}

async fn config_map(source: &dyn ConfigSource, name: &str) -> Result<BTreeMap<String, String>, ControllerError> {
    source
        .config_map_data(SYSTEM_NAMESPACE, name)
        .await?
        .ok_or_else(|| ControllerError::Bootstrap(format!("ConfigMap {SYSTEM_NAMESPACE}/{name} not found")))
}

/// Build the process configuration
///
/// `env_password` is the value of `APIC_PASSWORD`, passed in by the caller.
///
/// # Errors
/// Fails when a ConfigMap or required key is missing, when exec into the
/// controller pod fails, or when neither a private key nor a password is
/// available.
pub async fn bootstrap(source: &dyn ConfigSource, env_password: Option<String>) -> Result<CniConfig, ControllerError> {
    let controller_data = config_map(source, CONTROLLER_CONFIG_MAP).await?;
    let raw = controller_data.get(CONTROLLER_CONFIG_KEY).ok_or_else(|| {
        ControllerError::InvalidConfig(format!("{CONTROLLER_CONFIG_MAP} has no {CONTROLLER_CONFIG_KEY} key"))
    })?;
    let controller: ControllerConfig = serde_json::from_str(raw)?;

    let contracts = config_map(source, CONTRACTS_CONFIG_MAP).await?;
    let provided_contracts = contract_list(&contracts, "provided")?;
    let consumed_contracts = contract_list(&contracts, "consumed")?;

    let host = required(controller.apic_hosts.and_then(|hosts| hosts.into_iter().next()), "apic-hosts")?;
    let username = required(controller.apic_username, "apic-username")?;
    let bridge_domain = bridge_domain_from_dn(&required(controller.aci_podbd_dn, "aci-podbd-dn")?)?;

    let pods = source.pod_names(SYSTEM_NAMESPACE).await?;
    let private_key = match pods.iter().find(|pod| pod.contains(CONTROLLER_POD_MARKER)) {
        Some(pod) => {
            let key_path = required(controller.apic_private_key_path, "apic-private-key-path")?;
            info!("Reading APIC private key from pod {}", pod);
            let command = format!("cat {key_path}");
            let output = source
                .exec(SYSTEM_NAMESPACE, pod, &["/bin/sh", "-c", &command])
                .await?;
            if output.trim().is_empty() {
                warn!("Pod {} returned an empty private key", pod);
                None
            } else {
                Some(output)
            }
        }
        None => None,
    };

    let auth = match (private_key, env_password.filter(|p| !p.is_empty())) {
        (Some(key), _) => ApicAuth::certificate(&username, key),
        (None, Some(password)) => {
            info!("Using password authentication from {}", PASSWORD_ENV);
            ApicAuth::Password(password)
        }
        (None, None) => {
            return Err(ControllerError::Bootstrap(
                "could not find APIC private key or password".to_string(),
            ));
        }
    };

    Ok(CniConfig {
        apic: ApicConfig { host, username, auth },
        tenant: required(controller.aci_policy_tenant, "aci-policy-tenant")?,
        application_profile: required(controller.app_profile, "app-profile")?,
        bridge_domain,
        vmm_domain: required(controller.aci_vmm_domain, "aci-vmm-domain")?,
        vmm_domain_type: required(controller.aci_vmm_type, "aci-vmm-type")?,
        provided_contracts,
        consumed_contracts,
    })
}
