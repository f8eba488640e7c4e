//! ApicClient trait for mocking
//!
//! The reconciler is written against this capability set. `ApicClient`
//! implements it against a real APIC; `MockApicClient` (feature
//! `test-util`) implements it in memory.

use crate::error::ApicError;

/// EPG and contract operations on the fabric
///
/// All methods must be `Send` to work with Tokio's work-stealing runtime;
/// implementations are shared across reconcile workers.
#[async_trait::async_trait]
pub trait ApicClientTrait: Send + Sync {
    /// Create or update EPG `name` under `tenant`/`app`, bind it to bridge
    /// domain `bd` and VMM domain `vmm` of type `vmm_type`, then verify the
    /// VMM binding reads back.
    async fn create_epg(
        &self,
        name: &str,
        app: &str,
        tenant: &str,
        bd: &str,
        vmm: &str,
        vmm_type: &str,
    ) -> Result<(), ApicError>;

    /// Remove the EPG; succeeds when it is already absent.
    async fn delete_epg(&self, name: &str, app: &str, tenant: &str) -> Result<(), ApicError>;

    /// True iff the EPG DN resolves to an object.
    async fn epg_exists(&self, name: &str, app: &str, tenant: &str) -> Result<bool, ApicError>;

    /// Create (or no-op) the `rscons-<contract>` relation.
    async fn consume_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError>;

    /// Create (or no-op) the `rsprov-<contract>` relation.
    async fn provide_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError>;

    /// Names of contracts the EPG consumes; empty when the EPG is absent.
    async fn get_consumed_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError>;

    /// Names of contracts the EPG provides; empty when the EPG is absent.
    async fn get_provided_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError>;
}
