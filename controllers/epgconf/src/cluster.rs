//! Kubernetes API access used by the reconciler and bootstrap.
//!
//! `ClusterClient` is the slice of the API server the reconciler needs;
//! `KubeClusterClient` implements it, and bootstrap's `ConfigSource`, over a
//! live `kube::Client`. Every call goes straight to the API server so a
//! reconcile always sees its own previous writes.

use crate::bootstrap::ConfigSource;
use crate::error::ControllerError;
use crds::{Epgconf, EpgconfState};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kube::api::{Api, AttachParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Cluster operations the reconciler depends on
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an Epgconf; `None` when it does not exist
    async fn get_epgconf(&self, namespace: &str, name: &str) -> Result<Option<Epgconf>, ControllerError>;

    /// Replace an Epgconf's object (metadata changes such as finalizers)
    async fn update_epgconf(&self, epgconf: &Epgconf) -> Result<Epgconf, ControllerError>;

    /// Write `status.state` through the status subresource
    async fn update_status(&self, namespace: &str, name: &str, state: EpgconfState) -> Result<(), ControllerError>;

    /// Annotations of a namespace; `None` when the namespace does not exist
    async fn namespace_annotations(&self, namespace: &str) -> Result<Option<BTreeMap<String, String>>, ControllerError>;

    /// Set one annotation with a strategic merge patch, keeping the others
    async fn annotate_namespace(&self, namespace: &str, key: &str, value: &str) -> Result<(), ControllerError>;

    /// Remove one annotation with a JSON patch; fails when the key is absent
    async fn remove_namespace_annotation(&self, namespace: &str, key: &str) -> Result<(), ControllerError>;
}

/// JSON pointer to an annotation (`/` and `~` escaped per RFC 6901)
#[must_use]
pub fn annotation_pointer(key: &str) -> String {
    format!("/metadata/annotations/{}", key.replace('~', "~0").replace('/', "~1"))
}

/// `ClusterClient` and `ConfigSource` over a live API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Wrap a Kubernetes client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn epgconfs(&self, namespace: &str) -> Api<Epgconf> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_epgconf(&self, namespace: &str, name: &str) -> Result<Option<Epgconf>, ControllerError> {
        Ok(self.epgconfs(namespace).get_opt(name).await?)
    }

    async fn update_epgconf(&self, epgconf: &Epgconf) -> Result<Epgconf, ControllerError> {
        let namespace = epgconf
            .namespace()
            .ok_or_else(|| ControllerError::InvalidConfig("Epgconf has no namespace".to_string()))?;
        let name = epgconf.name_any();
        Ok(self
            .epgconfs(&namespace)
            .replace(&name, &PostParams::default(), epgconf)
            .await?)
    }

    async fn update_status(&self, namespace: &str, name: &str, state: EpgconfState) -> Result<(), ControllerError> {
        let patch = json!({
            "status": {
                "state": state.as_str(),
            }
        });
        self.epgconfs(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn namespace_annotations(&self, namespace: &str) -> Result<Option<BTreeMap<String, String>>, ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(namespace).await?.map(|ns| ns.annotations().clone()))
    }

    async fn annotate_namespace(&self, namespace: &str, key: &str, value: &str) -> Result<(), ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "annotations": {
                    key: value
                }
            }
        });
        api.patch(namespace, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn remove_namespace_annotation(&self, namespace: &str, key: &str) -> Result<(), ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch: json_patch::Patch = serde_json::from_value(json!([
            { "op": "remove", "path": annotation_pointer(key) }
        ]))?;
        api.patch(namespace, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfigSource for KubeClusterClient {
    async fn config_map_data(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>, ControllerError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn pod_names(&self, namespace: &str) -> Result<Vec<String>, ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods.items.iter().map(ResourceExt::name_any).collect())
    }

    async fn exec(&self, namespace: &str, pod: &str, command: &[&str]) -> Result<String, ControllerError> {
        debug!("Executing in pod {}/{}", namespace, pod);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default().stdin(false).stdout(true).stderr(false);
        let mut attached = api.exec(pod, command.iter().copied(), &params).await?;

        let mut output = String::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| ControllerError::Exec(format!("reading stdout of {pod}: {e}")))?;
        }
        attached
            .join()
            .await
            .map_err(|e| ControllerError::Exec(format!("exec session in {pod}: {e}")))?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_pointer_escapes_slash() {
        assert_eq!(
            annotation_pointer("opflex.cisco.com/endpoint-group"),
            "/metadata/annotations/opflex.cisco.com~1endpoint-group"
        );
        assert_eq!(annotation_pointer("a~b"), "/metadata/annotations/a~0b");
    }

    #[test]
    fn test_remove_patch_shape() {
        let patch: json_patch::Patch = serde_json::from_value(json!([
            { "op": "remove", "path": annotation_pointer("opflex.cisco.com/endpoint-group") }
        ]))
        .unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{ "op": "remove", "path": "/metadata/annotations/opflex.cisco.com~1endpoint-group" }])
        );
    }
}
