//! Epgconf CRD
//!
//! Opts a namespace in to having a matching Endpoint Group in the ACI
//! fabric. The resource carries no desired state of its own: its presence in
//! a namespace is the intent, and the operator reports the outcome in
//! `status.state`.

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSON, JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// API group of the Epgconf resource
pub const GROUP: &str = "epg.custom.aci";
/// Served and stored version
pub const VERSION: &str = "v1alpha1";
/// Kind
pub const KIND: &str = "Epgconf";
/// Plural resource name used in API paths
pub const PLURAL: &str = "epgconfs";

/// `epg.custom.aci/v1alpha1` Epgconf
///
/// Defined by hand rather than through `#[derive(CustomResource)]` so that
/// `spec` stays optional on the wire. Objects written without a spec (or
/// with `spec: null`) decode to the default spec.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Epgconf {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state; empty
    #[serde(default, deserialize_with = "null_as_default")]
    pub spec: EpgconfSpec,
    /// Observed state written by the operator
    #[serde(default)]
    pub status: Option<EpgconfStatus>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Serialize for Epgconf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.status.is_some() { 5 } else { 4 };
        let mut obj = serializer.serialize_struct(KIND, len)?;
        obj.serialize_field("apiVersion", &format!("{GROUP}/{VERSION}"))?;
        obj.serialize_field("kind", KIND)?;
        obj.serialize_field("metadata", &self.metadata)?;
        obj.serialize_field("spec", &self.spec)?;
        if let Some(status) = &self.status {
            obj.serialize_field("status", status)?;
        }
        obj.end()
    }
}

impl Epgconf {
    /// New object named `name` with no namespace and no status
    #[must_use]
    pub fn new(name: &str, spec: EpgconfSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec,
            status: None,
        }
    }

    /// CustomResourceDefinition to install in the cluster
    ///
    /// `spec` is not listed as required; the status subresource is enabled
    /// and `status.state` is shown as a printer column.
    #[must_use]
    pub fn crd() -> CustomResourceDefinition {
        let object = |properties: BTreeMap<String, JSONSchemaProps>| JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: (!properties.is_empty()).then_some(properties),
            ..JSONSchemaProps::default()
        };
        let string = || JSONSchemaProps {
            type_: Some("string".to_string()),
            ..JSONSchemaProps::default()
        };

        let state = JSONSchemaProps {
            description: Some("Outcome of the last reconciliation".to_string()),
            enum_: Some(vec![
                JSON(EpgconfState::Ready.as_str().into()),
                JSON(EpgconfState::Failed.as_str().into()),
            ]),
            ..string()
        };
        let schema = object(BTreeMap::from([
            ("apiVersion".to_string(), string()),
            ("kind".to_string(), string()),
            ("metadata".to_string(), object(BTreeMap::new())),
            ("spec".to_string(), object(BTreeMap::new())),
            ("status".to_string(), object(BTreeMap::from([("state".to_string(), state)]))),
        ]));

        CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(format!("{PLURAL}.{GROUP}")),
                ..ObjectMeta::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: GROUP.to_string(),
                names: CustomResourceDefinitionNames {
                    kind: KIND.to_string(),
                    list_kind: Some(format!("{KIND}List")),
                    plural: PLURAL.to_string(),
                    singular: Some("epgconf".to_string()),
                    ..CustomResourceDefinitionNames::default()
                },
                scope: "Namespaced".to_string(),
                versions: vec![CustomResourceDefinitionVersion {
                    name: VERSION.to_string(),
                    served: true,
                    storage: true,
                    schema: Some(CustomResourceValidation {
                        open_api_v3_schema: Some(schema),
                    }),
                    subresources: Some(CustomResourceSubresources {
                        status: Some(CustomResourceSubresourceStatus(serde_json::json!({}))),
                        scale: None,
                    }),
                    additional_printer_columns: Some(vec![CustomResourceColumnDefinition {
                        name: "State".to_string(),
                        type_: "string".to_string(),
                        json_path: ".status.state".to_string(),
                        ..CustomResourceColumnDefinition::default()
                    }]),
                    ..CustomResourceDefinitionVersion::default()
                }],
                ..CustomResourceDefinitionSpec::default()
            },
            status: None,
        }
    }
}

impl kube::Resource for Epgconf {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        PLURAL.into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Epgconf spec; carries no fields
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[allow(
    clippy::empty_structs_with_brackets,
    reason = "serde needs a map-shaped spec, a unit struct serializes as null"
)]
pub struct EpgconfSpec {}

/// Epgconf status
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EpgconfStatus {
    /// Outcome of the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<EpgconfState>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
/// Reconciliation outcome
///
/// Serializes as PascalCase ("Ready", "Failed") and accepts lowercase on
/// read.
#[serde(rename_all = "PascalCase")]
pub enum EpgconfState {
    /// The EPG, its bindings, contracts and namespace annotation are in place
    #[serde(alias = "ready")]
    Ready,

    /// The last ensure pass failed and will be retried
    #[serde(alias = "failed")]
    Failed,
}

impl EpgconfState {
    /// Wire value written to `status.state`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for EpgconfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;
    use serde_json::json;

    #[test]
    fn test_crd_identity() {
        let crd = Epgconf::crd();
        assert_eq!(crd.spec.group, "epg.custom.aci");
        assert_eq!(crd.spec.names.kind, "Epgconf");
        assert_eq!(crd.spec.names.list_kind.as_deref(), Some("EpgconfList"));
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
        assert!(crd.spec.versions[0].subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
        assert_eq!(crd.metadata.name.as_deref(), Some("epgconfs.epg.custom.aci"));
        assert_eq!(Epgconf::api_version(&()), "epg.custom.aci/v1alpha1");
        assert_eq!(Epgconf::plural(&()), "epgconfs");
    }

    #[test]
    fn test_crd_does_not_require_spec() {
        let crd = Epgconf::crd();
        let schema = crd.spec.versions[0]
            .schema
            .as_ref()
            .and_then(|s| s.open_api_v3_schema.as_ref())
            .unwrap();
        assert!(schema.required.is_none());
        assert!(schema.properties.as_ref().unwrap().contains_key("spec"));

        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(!yaml.contains("required"));
    }

    #[test]
    fn test_object_without_spec_decodes() {
        let obj: Epgconf = serde_json::from_value(json!({
            "apiVersion": "epg.custom.aci/v1alpha1",
            "kind": "Epgconf",
            "metadata": {"name": "cfg", "namespace": "team-a"}
        }))
        .unwrap();
        assert_eq!(obj.metadata.namespace.as_deref(), Some("team-a"));
        assert_eq!(obj.spec, EpgconfSpec::default());
        assert_eq!(obj.status, None);

        let obj: Epgconf = serde_json::from_value(json!({
            "metadata": {"name": "cfg"},
            "spec": null,
            "status": {"state": "Ready"}
        }))
        .unwrap();
        assert_eq!(obj.status, Some(EpgconfStatus { state: Some(EpgconfState::Ready) }));
    }

    #[test]
    fn test_serialized_object_carries_type_meta() {
        let mut obj = Epgconf::new("cfg", EpgconfSpec::default());
        assert_eq!(
            serde_json::to_value(&obj).unwrap(),
            json!({
                "apiVersion": "epg.custom.aci/v1alpha1",
                "kind": "Epgconf",
                "metadata": {"name": "cfg"},
                "spec": {}
            })
        );

        obj.status = Some(EpgconfStatus { state: Some(EpgconfState::Failed) });
        assert_eq!(serde_json::to_value(&obj).unwrap()["status"], json!({"state": "Failed"}));
    }

    #[test]
    fn test_state_serializes_pascal_case() {
        let status = EpgconfStatus { state: Some(EpgconfState::Ready) };
        assert_eq!(serde_json::to_value(&status).unwrap(), json!({"state": "Ready"}));

        let failed = serde_json::to_value(EpgconfState::Failed).unwrap();
        assert_eq!(failed, json!("Failed"));
    }

    #[test]
    fn test_state_accepts_lowercase() {
        let status: EpgconfStatus = serde_json::from_str(r#"{"state":"failed"}"#).unwrap();
        assert_eq!(status.state, Some(EpgconfState::Failed));
    }

    #[test]
    fn test_empty_status_omits_state() {
        let status: EpgconfStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.state, None);
        assert_eq!(serde_json::to_value(&status).unwrap(), json!({}));
    }
}
