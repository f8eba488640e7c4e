//! Mock ApicClient for unit testing
//!
//! In-memory fabric keyed by EPG DN. Saving an EPG again keeps its contract
//! relations, like an APIC upsert; contract writes against an absent EPG
//! fail the way APIC rejects a child without its parent.

use crate::apic_trait::ApicClientTrait;
use crate::dn;
use crate::error::ApicError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Fabric-side view of one EPG
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockEndpointGroup {
    /// EPG name (`<namespace>_EPG`)
    pub name: String,
    /// Owning tenant
    pub tenant: String,
    /// Owning application profile
    pub app: String,
    /// Bound bridge domain
    pub bridge_domain: String,
    /// Bound VMM domain
    pub vmm_domain: String,
    /// VMM domain type
    pub vmm_domain_type: String,
    /// Orchestrator annotation
    pub annotation: String,
    /// Consumed contract names, in insertion order
    pub consumed: Vec<String>,
    /// Provided contract names, in insertion order
    pub provided: Vec<String>,
}

/// Mock ApicClient for testing
///
/// Clones share state, so a test can keep a handle while the reconciler
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MockApicClient {
    endpoint_groups: Arc<Mutex<HashMap<String, MockEndpointGroup>>>,
    failing_operations: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockApicClient {
    /// Create an empty mock fabric
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an EPG (for assertions)
    #[must_use]
    pub fn get_epg(&self, name: &str, app: &str, tenant: &str) -> Option<MockEndpointGroup> {
        lock(&self.endpoint_groups).get(&dn::epg_dn(tenant, app, name)).cloned()
    }

    /// Add an EPG to the mock store (for test setup)
    pub fn add_epg(&self, epg: MockEndpointGroup) {
        let key = dn::epg_dn(&epg.tenant, &epg.app, &epg.name);
        lock(&self.endpoint_groups).insert(key, epg);
    }

    /// Make every call of `operation` fail until cleared
    ///
    /// Operation names match the trait methods (`create_epg`,
    /// `consume_contract`, ...).
    pub fn fail_operation(&self, operation: &str) {
        lock(&self.failing_operations).insert(operation.to_string());
    }

    /// Clear all injected failures
    pub fn clear_failures(&self) {
        lock(&self.failing_operations).clear();
    }

    /// Every call made so far, as `operation:dn`
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of calls of `operation` made so far
    #[must_use]
    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        lock(&self.calls).iter().filter(|c| c.starts_with(&prefix)).count()
    }

    fn record(&self, operation: &str, target: &str) -> Result<(), ApicError> {
        lock(&self.calls).push(format!("{operation}:{target}"));
        if lock(&self.failing_operations).contains(operation) {
            return Err(ApicError::Api {
                code: "500".to_string(),
                text: format!("injected failure for {operation} on {target}"),
            });
        }
        Ok(())
    }

    fn add_contract(&self, epg_dn: &str, contract: &str, consumed: bool) -> Result<(), ApicError> {
        let mut groups = lock(&self.endpoint_groups);
        let epg = groups
            .get_mut(epg_dn)
            .ok_or_else(|| ApicError::NotFound(format!("parent {epg_dn} may not exists")))?;
        let contracts = if consumed { &mut epg.consumed } else { &mut epg.provided };
        if !contracts.iter().any(|c| c == contract) {
            contracts.push(contract.to_string());
        }
        Ok(())
    }

    fn contracts(&self, epg_dn: &str, consumed: bool) -> Vec<String> {
        lock(&self.endpoint_groups)
            .get(epg_dn)
            .map(|epg| if consumed { epg.consumed.clone() } else { epg.provided.clone() })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ApicClientTrait for MockApicClient {
    async fn create_epg(
        &self,
        name: &str,
        app: &str,
        tenant: &str,
        bd: &str,
        vmm: &str,
        vmm_type: &str,
    ) -> Result<(), ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, name);
        self.record("create_epg", &epg_dn)?;

        let mut groups = lock(&self.endpoint_groups);
        let epg = groups.entry(epg_dn).or_default();
        epg.name = name.to_string();
        epg.app = app.to_string();
        epg.tenant = tenant.to_string();
        epg.bridge_domain = bd.to_string();
        epg.vmm_domain = vmm.to_string();
        epg.vmm_domain_type = vmm_type.to_string();
        epg.annotation = dn::orchestrator_annotation(vmm_type);
        Ok(())
    }

    async fn delete_epg(&self, name: &str, app: &str, tenant: &str) -> Result<(), ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, name);
        self.record("delete_epg", &epg_dn)?;
        lock(&self.endpoint_groups).remove(&epg_dn);
        Ok(())
    }

    async fn epg_exists(&self, name: &str, app: &str, tenant: &str) -> Result<bool, ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, name);
        self.record("epg_exists", &epg_dn)?;
        Ok(lock(&self.endpoint_groups).contains_key(&epg_dn))
    }

    async fn consume_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, epg);
        self.record("consume_contract", &dn::child_dn(&epg_dn, &dn::consumer_rn(contract)))?;
        self.add_contract(&epg_dn, contract, true)
    }

    async fn provide_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, epg);
        self.record("provide_contract", &dn::child_dn(&epg_dn, &dn::provider_rn(contract)))?;
        self.add_contract(&epg_dn, contract, false)
    }

    async fn get_consumed_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, epg);
        self.record("get_consumed_contracts", &epg_dn)?;
        Ok(self.contracts(&epg_dn, true))
    }

    async fn get_provided_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, epg);
        self.record("get_provided_contracts", &epg_dn)?;
        Ok(self.contracts(&epg_dn, false))
    }
}
