//! Test utilities for unit testing the reconciler and bootstrap
//!
//! `MockClusterClient` stands in for the API server, `MockConfigSource` for
//! the startup reads, and `FinalizerCheckingApic` watches the ordering of
//! fabric writes against finalizer persistence.

use crate::bootstrap::{ConfigSource, SYSTEM_NAMESPACE};
use crate::cluster::ClusterClient;
use crate::config::CniConfig;
use crate::error::ControllerError;
use crate::reconciler::FINALIZER;
use apic_client::{ApicAuth, ApicClientTrait, ApicConfig, ApicError, MockApicClient};
use crds::{Epgconf, EpgconfSpec, EpgconfState, EpgconfStatus};
use kube::ResourceExt;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Configuration used across reconciler tests
pub fn test_config() -> CniConfig {
    CniConfig {
        apic: ApicConfig {
            host: "10.0.0.1".to_string(),
            username: "kube".to_string(),
            auth: ApicAuth::Password("hunter2".to_string()),
        },
        tenant: "t1".to_string(),
        application_profile: "a1".to_string(),
        bridge_domain: "bd1".to_string(),
        vmm_domain: "k8s".to_string(),
        vmm_domain_type: "Kubernetes".to_string(),
        provided_contracts: vec!["c-p1".to_string()],
        consumed_contracts: vec!["c-c1".to_string()],
    }
}

/// `controller-config` document matching `test_config()`
pub fn controller_config_json() -> String {
    json!({
        "apic-hosts": ["10.0.0.1", "10.0.0.2"],
        "apic-username": "kube",
        "apic-private-key-path": "/usr/local/etc/aci-cert/user.key",
        "aci-policy-tenant": "t1",
        "aci-podbd-dn": "uni/tn-t1/BD-bd1",
        "aci-vmm-domain": "k8s",
        "aci-vmm-type": "Kubernetes",
        "app-profile": "a1",
        "aci-vrf": "kube-vrf"
    })
    .to_string()
}

/// In-memory API server for Epgconfs and namespace annotations
///
/// Like the real API server, an object whose deletion timestamp is set is
/// removed as soon as its finalizer list is empty, and a JSON patch removing
/// an absent annotation is rejected.
#[derive(Debug, Clone, Default)]
pub struct MockClusterClient {
    epgconfs: Arc<Mutex<BTreeMap<(String, String), Epgconf>>>,
    namespaces: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
    failing_operations: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.namespaces
            .lock()
            .unwrap()
            .insert(namespace.to_string(), BTreeMap::from([("owner".to_string(), "team-a".to_string())]));
    }

    pub fn add_epgconf(&self, namespace: &str, name: &str) {
        let mut epgconf = Epgconf::new(name, EpgconfSpec::default());
        epgconf.metadata.namespace = Some(namespace.to_string());
        self.epgconfs.lock().unwrap().insert(key(namespace, name), epgconf);
    }

    pub fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) {
        let mut epgconfs = self.epgconfs.lock().unwrap();
        let epgconf = epgconfs.get_mut(&key(namespace, name)).unwrap();
        epgconf.finalizers_mut().push(finalizer.to_string());
    }

    /// Equivalent of `kubectl delete`
    pub fn mark_for_deletion(&self, namespace: &str, name: &str) {
        let mut epgconfs = self.epgconfs.lock().unwrap();
        let epgconf = epgconfs.get_mut(&key(namespace, name)).unwrap();
        epgconf.metadata.deletion_timestamp = Some(serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap());
        if epgconf.finalizers().is_empty() {
            epgconfs.remove(&key(namespace, name));
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Epgconf> {
        self.epgconfs.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    pub fn state(&self, namespace: &str, name: &str) -> Option<EpgconfState> {
        self.get(namespace, name)
            .and_then(|e| e.status)
            .and_then(|s| s.state)
    }

    pub fn annotations(&self, namespace: &str) -> BTreeMap<String, String> {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_operation(&self, operation: &str) {
        self.failing_operations.lock().unwrap().insert(operation.to_string());
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == operation).count()
    }

    fn record(&self, operation: &str) -> Result<(), ControllerError> {
        self.calls.lock().unwrap().push(operation.to_string());
        if self.failing_operations.lock().unwrap().contains(operation) {
            return Err(ControllerError::Cluster(format!("injected failure for {operation}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn get_epgconf(&self, namespace: &str, name: &str) -> Result<Option<Epgconf>, ControllerError> {
        self.record("get_epgconf")?;
        Ok(self.get(namespace, name))
    }

    async fn update_epgconf(&self, epgconf: &Epgconf) -> Result<Epgconf, ControllerError> {
        self.record("update_epgconf")?;
        let id = key(&epgconf.namespace().unwrap_or_default(), &epgconf.name_any());
        let mut epgconfs = self.epgconfs.lock().unwrap();
        if !epgconfs.contains_key(&id) {
            return Err(ControllerError::Cluster(format!("epgconfs {:?} not found", id)));
        }
        if epgconf.metadata.deletion_timestamp.is_some() && epgconf.finalizers().is_empty() {
            epgconfs.remove(&id);
        } else {
            epgconfs.insert(id, epgconf.clone());
        }
        Ok(epgconf.clone())
    }

    async fn update_status(&self, namespace: &str, name: &str, state: EpgconfState) -> Result<(), ControllerError> {
        self.record("update_status")?;
        let mut epgconfs = self.epgconfs.lock().unwrap();
        let epgconf = epgconfs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ControllerError::Cluster(format!("epgconfs {namespace}/{name} not found")))?;
        epgconf.status = Some(EpgconfStatus { state: Some(state) });
        Ok(())
    }

    async fn namespace_annotations(&self, namespace: &str) -> Result<Option<BTreeMap<String, String>>, ControllerError> {
        self.record("namespace_annotations")?;
        Ok(self.namespaces.lock().unwrap().get(namespace).cloned())
    }

    async fn annotate_namespace(&self, namespace: &str, key: &str, value: &str) -> Result<(), ControllerError> {
        self.record("annotate_namespace")?;
        let mut namespaces = self.namespaces.lock().unwrap();
        let annotations = namespaces
            .get_mut(namespace)
            .ok_or_else(|| ControllerError::Cluster(format!("namespaces {namespace} not found")))?;
        annotations.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_namespace_annotation(&self, namespace: &str, key: &str) -> Result<(), ControllerError> {
        self.record("remove_namespace_annotation")?;
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces
            .get_mut(namespace)
            .and_then(|annotations| annotations.remove(key))
            .map(|_| ())
            .ok_or_else(|| ControllerError::Cluster("the server rejected our request: remove of missing path".to_string()))
    }
}

/// Fabric client that checks the Epgconf carries the finalizer in the
/// cluster whenever a mutating fabric call is made
#[derive(Debug, Clone)]
pub struct FinalizerCheckingApic {
    inner: MockApicClient,
    cluster: MockClusterClient,
    namespace: String,
    name: String,
    checked: Arc<AtomicUsize>,
    unguarded: Arc<AtomicUsize>,
}

impl FinalizerCheckingApic {
    pub fn new(inner: MockApicClient, cluster: MockClusterClient, namespace: &str, name: &str) -> Self {
        Self {
            inner,
            cluster,
            namespace: namespace.to_string(),
            name: name.to_string(),
            checked: Arc::new(AtomicUsize::new(0)),
            unguarded: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn checked_writes(&self) -> usize {
        self.checked.load(Ordering::SeqCst)
    }

    pub fn unguarded_writes(&self) -> usize {
        self.unguarded.load(Ordering::SeqCst)
    }

    fn check(&self) {
        self.checked.fetch_add(1, Ordering::SeqCst);
        let guarded = self
            .cluster
            .get(&self.namespace, &self.name)
            .is_some_and(|e| e.finalizers().iter().any(|f| f == FINALIZER));
        if !guarded {
            self.unguarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl ApicClientTrait for FinalizerCheckingApic {
    async fn create_epg(
        &self,
        name: &str,
        app: &str,
        tenant: &str,
        bd: &str,
        vmm: &str,
        vmm_type: &str,
    ) -> Result<(), ApicError> {
        self.check();
        self.inner.create_epg(name, app, tenant, bd, vmm, vmm_type).await
    }

    async fn delete_epg(&self, name: &str, app: &str, tenant: &str) -> Result<(), ApicError> {
        self.check();
        self.inner.delete_epg(name, app, tenant).await
    }

    async fn epg_exists(&self, name: &str, app: &str, tenant: &str) -> Result<bool, ApicError> {
        self.inner.epg_exists(name, app, tenant).await
    }

    async fn consume_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError> {
        self.check();
        self.inner.consume_contract(epg, app, tenant, contract).await
    }

    async fn provide_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError> {
        self.check();
        self.inner.provide_contract(epg, app, tenant, contract).await
    }

    async fn get_consumed_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError> {
        self.inner.get_consumed_contracts(epg, app, tenant).await
    }

    async fn get_provided_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError> {
        self.inner.get_provided_contracts(epg, app, tenant).await
    }
}

/// In-memory ConfigMaps and pods of `aci-containers-system`
#[derive(Debug, Default)]
pub struct MockConfigSource {
    config_maps: HashMap<String, BTreeMap<String, String>>,
    pods: Vec<String>,
    exec_outputs: HashMap<String, String>,
    exec_calls: Mutex<Vec<Vec<String>>>,
}

impl MockConfigSource {
    pub fn add_config_map(&mut self, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.config_maps.insert(name.to_string(), data);
    }

    pub fn add_pod(&mut self, name: &str) {
        self.pods.push(name.to_string());
    }

    pub fn set_exec_output(&mut self, pod: &str, output: &str) {
        self.exec_outputs.insert(pod.to_string(), output.to_string());
    }

    /// Every exec as `[pod, command...]`
    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.exec_calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ConfigSource for MockConfigSource {
    async fn config_map_data(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>, ControllerError> {
        if namespace != SYSTEM_NAMESPACE {
            return Ok(None);
        }
        Ok(self.config_maps.get(name).cloned())
    }

    async fn pod_names(&self, namespace: &str) -> Result<Vec<String>, ControllerError> {
        if namespace != SYSTEM_NAMESPACE {
            return Ok(Vec::new());
        }
        Ok(self.pods.clone())
    }

    async fn exec(&self, _namespace: &str, pod: &str, command: &[&str]) -> Result<String, ControllerError> {
        let mut call = vec![pod.to_string()];
        call.extend(command.iter().map(|c| (*c).to_string()));
        self.exec_calls.lock().unwrap().push(call);
        self.exec_outputs
            .get(pod)
            .cloned()
            .ok_or_else(|| ControllerError::Exec(format!("pod {pod} not found")))
    }
}

/// Kubernetes client whose API server accepts connections and never answers
///
/// Keep the returned listener alive for as long as the client is used.
pub async fn unresponsive_kube_client() -> (kube::Client, tokio::net::TcpListener) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let client = kube::Client::try_from(kube::Config::new(url.parse().unwrap())).unwrap();
    (client, listener)
}
