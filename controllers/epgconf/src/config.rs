//! Process-wide operator configuration.

use apic_client::ApicConfig;

/// Suffix appended to a namespace name to form its EPG name
pub const EPG_SUFFIX: &str = "_EPG";

/// Fabric settings assembled once at startup and shared read-only
///
/// `Debug` output redacts the APIC password and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniConfig {
    /// APIC host, user and credentials
    pub apic: ApicConfig,
    /// Tenant owning every managed EPG
    pub tenant: String,
    /// Application profile owning every managed EPG
    pub application_profile: String,
    /// Bridge domain name each EPG binds to
    pub bridge_domain: String,
    /// VMM domain name each EPG binds to
    pub vmm_domain: String,
    /// VMM domain type (e.g. `Kubernetes`, `OpenShift`)
    pub vmm_domain_type: String,
    /// Contracts every EPG must provide
    pub provided_contracts: Vec<String>,
    /// Contracts every EPG must consume
    pub consumed_contracts: Vec<String>,
}

impl CniConfig {
    /// EPG name for `namespace`
    #[must_use]
    pub fn epg_name(namespace: &str) -> String {
        format!("{namespace}{EPG_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;

    #[test]
    fn test_epg_name() {
        assert_eq!(CniConfig::epg_name("ns-1"), "ns-1_EPG");
    }

    #[test]
    fn test_debug_hides_password() {
        let config = test_config();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("t1"));
    }
}
