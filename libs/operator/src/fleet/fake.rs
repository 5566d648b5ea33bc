use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::crd::common::FleetWorkspace;
use crate::error::Result;
use crate::fleet::client::{ClusterInfo, FleetClient};
use crate::fleet::types::{Bundle, BundleDeployment, BundleSpec};

/// An in-memory `FleetClient` for unit tests of components downstream of the
/// façade (resolver, synthesizer, status aggregator), avoiding a live
/// Kubernetes API server. Reconciler-level tests instead mock the
/// `kube::Client` transport directly with `tower-test`, via the
/// `ApiServerVerifier` pattern in each controller's test module.
#[derive(Default)]
pub struct FakeFleetClient {
    pub clusters: Mutex<Vec<ClusterInfo>>,
    pub bundles: Mutex<BTreeMap<(String, String), (BundleSpec, BTreeMap<String, String>, String)>>,
    pub bundle_deployments: Mutex<BTreeMap<(String, String), Vec<BundleDeployment>>>,
    pub config_maps: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
    pub secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>>,
    pub apply_count: Mutex<u32>,
    pub scan_markers: Mutex<Vec<(String, String, String)>>,
    pub observability_markers: Mutex<Vec<(String, String, String)>>,
}

impl FakeFleetClient {
    pub fn with_clusters(clusters: Vec<ClusterInfo>) -> Self {
        Self {
            clusters: Mutex::new(clusters),
            ..Default::default()
        }
    }

    pub fn put_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.config_maps
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn put_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn put_bundle_deployments(&self, bundle_namespace: &str, bundle_name: &str, deployments: Vec<BundleDeployment>) {
        self.bundle_deployments
            .lock()
            .unwrap()
            .insert((bundle_namespace.to_string(), bundle_name.to_string()), deployments);
    }

    pub fn bundle_count(&self) -> usize {
        self.bundles.lock().unwrap().len()
    }

    pub fn apply_calls(&self) -> u32 {
        *self.apply_count.lock().unwrap()
    }

    pub fn scan_marker_count(&self) -> usize {
        self.scan_markers.lock().unwrap().len()
    }

    pub fn observability_marker_count(&self) -> usize {
        self.observability_markers.lock().unwrap().len()
    }
}

#[async_trait]
impl FleetClient for FakeFleetClient {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>> {
        Ok(self.clusters.lock().unwrap().clone())
    }

    async fn apply_bundle(
        &self,
        namespace: &str,
        name: &str,
        spec: BundleSpec,
        labels: BTreeMap<String, String>,
        content_hash: &str,
    ) -> Result<bool> {
        let mut bundles = self.bundles.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        if let Some((_, _, existing_hash)) = bundles.get(&key) {
            if existing_hash == content_hash {
                return Ok(false);
            }
        }
        *self.apply_count.lock().unwrap() += 1;
        bundles.insert(key, (spec, labels, content_hash.to_string()));
        Ok(true)
    }

    async fn delete_bundle(&self, namespace: &str, name: &str) -> Result<()> {
        self.bundles
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_owned_bundles(&self, owner_kind: &str, owner_namespace: &str, owner_name: &str, workspace: FleetWorkspace) -> Result<Vec<Bundle>> {
        use kube::api::ObjectMeta;

        let bundles = self.bundles.lock().unwrap();
        Ok(bundles
            .iter()
            .filter(|((namespace, _), (_, labels, _))| {
                namespace == workspace.namespace()
                    && labels.get(crate::crd::common::LABEL_OWNER_KIND).map(String::as_str) == Some(owner_kind)
                    && labels.get(crate::crd::common::LABEL_OWNER_NAMESPACE).map(String::as_str) == Some(owner_namespace)
                    && labels.get(crate::crd::common::LABEL_OWNER_NAME).map(String::as_str) == Some(owner_name)
            })
            .map(|((namespace, name), (spec, labels, _))| Bundle {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: spec.clone(),
                status: None,
            })
            .collect())
    }

    async fn list_bundle_deployments(&self, bundle_namespace: &str, bundle_name: &str) -> Result<Vec<BundleDeployment>> {
        Ok(self
            .bundle_deployments
            .lock()
            .unwrap()
            .get(&(bundle_namespace.to_string(), bundle_name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .config_maps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn ensure_scan_marker(&self, namespace: &str, owner_kind: &str, owner_name: &str) -> Result<()> {
        let mut markers = self.scan_markers.lock().unwrap();
        let entry = (namespace.to_string(), owner_kind.to_string(), owner_name.to_string());
        if !markers.contains(&entry) {
            markers.push(entry);
        }
        Ok(())
    }

    async fn ensure_observability_marker(&self, namespace: &str, owner_kind: &str, owner_name: &str) -> Result<()> {
        let mut markers = self.observability_markers.lock().unwrap();
        let entry = (namespace.to_string(), owner_kind.to_string(), owner_name.to_string());
        if !markers.contains(&entry) {
            markers.push(entry);
        }
        Ok(())
    }
}
