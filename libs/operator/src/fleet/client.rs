use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};

use crate::crd::common::FleetWorkspace;
use crate::error::{Error, Result};
use crate::fleet::types::{
    Bundle, BundleDeployment, BundleSpec, Cluster, ObservabilityMarker, ObservabilityMarkerSpec,
    ScanMarker, ScanMarkerSpec, CLUSTER_STATE_ACTIVE,
};

/// A cluster as reported by the Rancher inventory, restricted to the fields
/// the core consumes: `{id, labels, state}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub state: String,
}

impl ClusterInfo {
    pub fn is_active(&self) -> bool {
        self.state == CLUSTER_STATE_ACTIVE
    }
}

/// Read-only cluster discovery plus create/update/delete of Fleet Bundles and
/// read-back of BundleDeployment status, behind a trait so reconciler tests
/// can substitute a fake implementation.
#[async_trait]
pub trait FleetClient: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>>;

    /// Upserts a Bundle keyed by (namespace, name). Returns `true` if a write
    /// was actually performed (content differed from what's stored).
    async fn apply_bundle(&self, namespace: &str, name: &str, spec: BundleSpec, labels: BTreeMap<String, String>, content_hash: &str) -> Result<bool>;

    async fn delete_bundle(&self, namespace: &str, name: &str) -> Result<()>;

    /// Lists Bundles owned by this resource, scoped to `workspace`'s namespace
    /// — a chart's Bundles for different workspaces never share a namespace,
    /// so this never needs to search across workspaces.
    async fn list_owned_bundles(&self, owner_kind: &str, owner_namespace: &str, owner_name: &str, workspace: FleetWorkspace) -> Result<Vec<Bundle>>;

    async fn list_bundle_deployments(&self, bundle_namespace: &str, bundle_name: &str) -> Result<Vec<BundleDeployment>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    /// Ensures the opaque `ScanMarker` side-effect exists for this owner when
    /// `security: enabled`. Idempotent: creating it twice is a no-op.
    async fn ensure_scan_marker(&self, namespace: &str, owner_kind: &str, owner_name: &str) -> Result<()>;

    /// Ensures the opaque `ObservabilityMarker` side-effect exists for this
    /// owner when `observability: enabled`.
    async fn ensure_observability_marker(&self, namespace: &str, owner_kind: &str, owner_name: &str) -> Result<()>;
}

/// A `FleetClient` backed by a real `kube::Client`.
pub struct KubeFleetClient {
    client: Client,
}

impl KubeFleetClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FleetClient for KubeFleetClient {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let clusters = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::TransientClusterListFailure(e.to_string()))?;
        Ok(clusters
            .into_iter()
            .map(|c| ClusterInfo {
                id: c.name_any(),
                labels: c.labels().clone(),
                state: c.status.unwrap_or_default().state,
            })
            .collect())
    }

    async fn apply_bundle(
        &self,
        namespace: &str,
        name: &str,
        spec: BundleSpec,
        labels: BTreeMap<String, String>,
        content_hash: &str,
    ) -> Result<bool> {
        let api: Api<Bundle> = Api::namespaced(self.client.clone(), namespace);
        if let Ok(existing) = api.get(name).await {
            let existing_hash = existing
                .annotations()
                .get(crate::crd::common::ANNOTATION_CONTENT_HASH)
                .cloned()
                .unwrap_or_default();
            if existing_hash == content_hash {
                return Ok(false);
            }
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(
            crate::crd::common::ANNOTATION_CONTENT_HASH.to_string(),
            content_hash.to_string(),
        );

        let bundle = Bundle {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec,
            status: None,
        };

        api.patch(
            name,
            &PatchParams::apply("herd-operator").force(),
            &Patch::Apply(&bundle),
        )
        .await?;
        Ok(true)
    }

    async fn delete_bundle(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Bundle> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_owned_bundles(&self, owner_kind: &str, owner_namespace: &str, owner_name: &str, workspace: FleetWorkspace) -> Result<Vec<Bundle>> {
        let api: Api<Bundle> = Api::namespaced(self.client.clone(), workspace.namespace());
        let selector = format!(
            "{}={},{}={},{}={}",
            crate::crd::common::LABEL_OWNER_KIND,
            owner_kind,
            crate::crd::common::LABEL_OWNER_NAME,
            owner_name,
            crate::crd::common::LABEL_OWNER_NAMESPACE,
            owner_namespace,
        );
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn list_bundle_deployments(&self, bundle_namespace: &str, bundle_name: &str) -> Result<Vec<BundleDeployment>> {
        let api: Api<BundleDeployment> = Api::namespaced(self.client.clone(), bundle_namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|bd| bd.spec.bundle_name == bundle_name)
            .collect())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(Some(cm.data.unwrap_or_default())),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(
                secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect(),
            )),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_scan_marker(&self, namespace: &str, owner_kind: &str, owner_name: &str) -> Result<()> {
        let name = format!("{}-{}", owner_kind.to_lowercase(), owner_name);
        let api: Api<ScanMarker> = Api::namespaced(self.client.clone(), namespace);
        let marker = ScanMarker {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: ScanMarkerSpec {
                owner_kind: owner_kind.to_string(),
                owner_name: owner_name.to_string(),
            },
        };
        api.patch(
            &name,
            &PatchParams::apply("herd-operator").force(),
            &Patch::Apply(&marker),
        )
        .await?;
        Ok(())
    }

    async fn ensure_observability_marker(&self, namespace: &str, owner_kind: &str, owner_name: &str) -> Result<()> {
        let name = format!("{}-{}", owner_kind.to_lowercase(), owner_name);
        let api: Api<ObservabilityMarker> = Api::namespaced(self.client.clone(), namespace);
        let marker = ObservabilityMarker {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: ObservabilityMarkerSpec {
                owner_kind: owner_kind.to_string(),
                owner_name: owner_name.to_string(),
            },
        };
        api.patch(
            &name,
            &PatchParams::apply("herd-operator").force(),
            &Patch::Apply(&marker),
        )
        .await?;
        Ok(())
    }
}
