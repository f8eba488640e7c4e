//! APIC REST payloads
//!
//! Every APIC response is an `imdata` array of single-key objects
//! (`{"<class>": {"attributes": {...}}}`); every write is one such object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// EPG class
pub const EPG_CLASS: &str = "fvAEpg";
/// EPG-to-bridge-domain relation class
pub const BD_RELATION_CLASS: &str = "fvRsBd";
/// EPG-to-VMM-domain relation class
pub const VMM_RELATION_CLASS: &str = "fvRsDomAtt";
/// Consumed contract relation class
pub const CONSUMER_CLASS: &str = "fvRsCons";
/// Provided contract relation class
pub const PROVIDER_CLASS: &str = "fvRsProv";
/// Fabric node class, used as the connectivity probe
pub const TOP_SYSTEM_CLASS: &str = "topSystem";

/// Attribute holding a contract relation's target contract name
pub const CONTRACT_NAME_ATTR: &str = "tnVzBrCPName";

/// Body of one managed object
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ManagedObject {
    /// Object attributes; APIC encodes every value as a string
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ManagedObject {
    /// String attribute lookup
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }
}

/// Response envelope returned by every APIC endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApicResponse {
    /// Number of objects matched by the query
    #[serde(rename = "totalCount", default)]
    pub total_count: Option<String>,

    /// Returned objects, each keyed by its class name
    #[serde(default)]
    pub imdata: Vec<HashMap<String, ManagedObject>>,
}

impl ApicResponse {
    /// Objects of `class`, in response order
    pub fn objects<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a ManagedObject> + 'a {
        self.imdata.iter().filter_map(move |entry| entry.get(class))
    }

    /// `(code, text)` of the first `error` object, if APIC returned one
    #[must_use]
    pub fn error(&self) -> Option<(String, String)> {
        self.objects("error").next().map(|err| {
            (
                err.attr("code").unwrap_or_default().to_string(),
                err.attr("text").unwrap_or_default().to_string(),
            )
        })
    }

    /// Values of `attribute` across all objects of `class`
    #[must_use]
    pub fn attribute_values(&self, class: &str, attribute: &str) -> Vec<String> {
        self.objects(class)
            .filter_map(|mo| mo.attr(attribute))
            .map(str::to_string)
            .collect()
    }
}

/// Builds `{"<class>": {"attributes": {...}}}`
#[must_use]
pub fn managed_object(class: &str, attributes: &[(&str, &str)]) -> Value {
    let attributes: Map<String, Value> = attributes
        .iter()
        .map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
        .collect();
    let mut body = Map::new();
    body.insert("attributes".to_string(), Value::Object(attributes));
    let mut root = Map::new();
    root.insert(class.to_string(), Value::Object(body));
    Value::Object(root)
}

/// `aaaLogin` request body
#[must_use]
pub fn login_payload(username: &str, password: &str) -> Value {
    managed_object("aaaUser", &[("name", username), ("pwd", password)])
}

/// `fvAEpg` create-or-update body
#[must_use]
pub fn epg_payload(dn: &str, name: &str, description: &str, annotation: &str) -> Value {
    managed_object(
        EPG_CLASS,
        &[("dn", dn), ("name", name), ("descr", description), ("annotation", annotation)],
    )
}

/// `fvRsBd` body binding an EPG to bridge domain `bd`
#[must_use]
pub fn bd_relation_payload(bd: &str) -> Value {
    managed_object(BD_RELATION_CLASS, &[("tnFvBDName", bd)])
}

/// `fvRsDomAtt` body binding an EPG to the VMM domain at `vmm_domain_dn`
#[must_use]
pub fn vmm_relation_payload(vmm_domain_dn: &str) -> Value {
    managed_object(VMM_RELATION_CLASS, &[("tDn", vmm_domain_dn)])
}

/// `fvRsCons` / `fvRsProv` body referencing `contract` by name
#[must_use]
pub fn contract_relation_payload(class: &str, contract: &str) -> Value {
    managed_object(class, &[(CONTRACT_NAME_ATTR, contract)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_epg_payload_shape() {
        let payload = epg_payload(
            "uni/tn-t1/ap-a1/epg-ns_EPG",
            "ns_EPG",
            "created by kubernetes operator",
            "orchestrator:kubernetes",
        );
        assert_eq!(
            payload,
            json!({"fvAEpg": {"attributes": {
                "dn": "uni/tn-t1/ap-a1/epg-ns_EPG",
                "name": "ns_EPG",
                "descr": "created by kubernetes operator",
                "annotation": "orchestrator:kubernetes"
            }}})
        );
    }

    #[test]
    fn test_contract_list_decoding() {
        let body = json!({
            "totalCount": "2",
            "imdata": [
                {"fvRsCons": {"attributes": {"tnVzBrCPName": "web", "dn": "x/rscons-web"}}},
                {"fvRsCons": {"attributes": {"tnVzBrCPName": "db", "dn": "x/rscons-db"}}}
            ]
        });
        let response: ApicResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.total_count.as_deref(), Some("2"));
        assert_eq!(response.attribute_values(CONSUMER_CLASS, CONTRACT_NAME_ATTR), vec!["web", "db"]);
        assert!(response.error().is_none());
    }

    #[test]
    fn test_error_decoding() {
        let body = json!({
            "totalCount": "1",
            "imdata": [{"error": {"attributes": {"code": "400", "text": "Request failed, uni/tn-x may not exists"}}}]
        });
        let response: ApicResponse = serde_json::from_value(body).unwrap();
        let (code, text) = response.error().unwrap();
        assert_eq!(code, "400");
        assert!(text.contains("may not exists"));
    }

    #[test]
    fn test_empty_response() {
        let response: ApicResponse = serde_json::from_str(r#"{"totalCount":"0","imdata":[]}"#).unwrap();
        assert_eq!(response.objects(EPG_CLASS).count(), 0);
    }
}
