//! Distinguished-name conventions for the objects this client manages.
//!
//! APIC addresses every managed object by a hierarchical DN. The builders
//! here are the single source of those strings; callers never format DNs
//! themselves.

/// Description stamped on every EPG the operator creates
pub const EPG_DESCRIPTION: &str = "created by kubernetes operator";

/// Relative name of the EPG-to-bridge-domain relation
pub const BD_RELATION_RN: &str = "rsbd";

/// `uni/tn-<tenant>/ap-<app>/epg-<name>`
#[must_use]
pub fn epg_dn(tenant: &str, app: &str, name: &str) -> String {
    format!("uni/tn-{tenant}/ap-{app}/epg-{name}")
}

/// `uni/vmmp-<vmmType>/dom-<vmm>`
#[must_use]
pub fn vmm_domain_dn(vmm_type: &str, vmm: &str) -> String {
    format!("uni/vmmp-{vmm_type}/dom-{vmm}")
}

/// Relative name of the EPG-to-VMM-domain relation
#[must_use]
pub fn vmm_relation_rn(vmm_domain_dn: &str) -> String {
    format!("rsdomAtt-[{vmm_domain_dn}]")
}

/// `rscons-<contract>`
#[must_use]
pub fn consumer_rn(contract: &str) -> String {
    format!("rscons-{contract}")
}

/// `rsprov-<contract>`
#[must_use]
pub fn provider_rn(contract: &str) -> String {
    format!("rsprov-{contract}")
}

/// Child DN under a parent
#[must_use]
pub fn child_dn(parent: &str, rn: &str) -> String {
    format!("{parent}/{rn}")
}

/// Name of the admin certificate registered for `user`
#[must_use]
pub fn admin_cert_name(user: &str) -> String {
    format!("{user}.crt")
}

/// DN of a user's certificate, sent with every signed request
#[must_use]
pub fn user_cert_dn(user: &str, cert_name: &str) -> String {
    format!("uni/userext/user-{user}/usercert-{cert_name}")
}

/// `orchestrator:<lowercase vmm type>`
#[must_use]
pub fn orchestrator_annotation(vmm_type: &str) -> String {
    format!("orchestrator:{}", vmm_type.to_lowercase())
}
