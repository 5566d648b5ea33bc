use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as K8sLabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `targets` is a tagged union: either an explicit set of cluster ids or a label
/// selector evaluated against the Rancher cluster inventory. Exactly one form
/// must be set; both-set or both-empty is rejected at validation time.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Targets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelectorSpec>,
}

impl Targets {
    /// Validates the "exactly one form" invariant.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.cluster_ids, &self.selector) {
            (Some(ids), None) if !ids.is_empty() => Ok(()),
            (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err("targets: exactly one of clusterIds/selector must be set, both are set".into()),
            (None, None) => Err("targets: exactly one of clusterIds/selector must be set, neither is set".into()),
            (Some(_), None) => Err("targets.clusterIds must not be empty".into()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorSpec {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl From<&LabelSelectorSpec> for K8sLabelSelector {
    fn from(value: &LabelSelectorSpec) -> Self {
        K8sLabelSelector {
            match_labels: Some(value.match_labels.clone()),
            match_expressions: None,
        }
    }
}

/// Accepts either a JSON boolean or the legacy string `"enabled"`, normalizing
/// both to `bool` at admission time.
#[derive(Clone, Copy, Debug, Serialize, JsonSchema, PartialEq, Eq, Default)]
pub struct Toggle(pub bool);

impl<'de> Deserialize<'de> for Toggle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bool(bool),
            Str(String),
        }
        let repr = Repr::deserialize(deserializer)?;
        Ok(Toggle(match repr {
            Repr::Bool(b) => b,
            Repr::Str(s) => s.eq_ignore_ascii_case("enabled") || s.eq_ignore_ascii_case("true"),
        }))
    }
}

/// A reference to a ConfigMap or Secret, optionally namespaced (defaults to the
/// parent resource's own namespace when absent).
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRefSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// The union of value sources a `ChartSpec`/`StepSpec` may carry. Any subset
/// may be set simultaneously; the merge pipeline applies whichever are
/// present in a fixed precedence order (see `merge.rs`).
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValuesSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_map_refs: Vec<ObjectRefSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_refs: Vec<ObjectRefSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_cluster_config_map_ref: Option<ObjectRefSpec>,
}

/// A cluster discovered via the Rancher/Fleet client façade.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResolvedCluster {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub workspace: FleetWorkspace,
}

/// A Fleet workspace, partitioning Bundles by cluster class.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FleetWorkspace {
    FleetLocal,
    FleetDefault,
}

impl FleetWorkspace {
    pub fn namespace(&self) -> &'static str {
        match self {
            FleetWorkspace::FleetLocal => "fleet-local",
            FleetWorkspace::FleetDefault => "fleet-default",
        }
    }
}

/// Deterministic identifier for a Bundle: `{resourceKind}-{resourceName}-{chartName}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct BundleKey {
    pub namespace: String,
    pub name: String,
}

impl BundleKey {
    pub fn new(owner_kind: &str, owner_name: &str, chart_name: &str, workspace: FleetWorkspace) -> Self {
        let raw = format!("{}-{}-{}", owner_kind.to_lowercase(), owner_name, chart_name);
        let truncated: String = raw.chars().take(63).collect();
        let name = truncated.trim_end_matches('-').to_string();
        BundleKey {
            namespace: workspace.namespace().to_string(),
            name,
        }
    }
}

/// Per-(chart, cluster) deployment status as observed from Fleet.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentObservation {
    pub chart_name: String,
    pub cluster_id: String,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Deployed,
    Failed,
    Blocked,
}

/// Overall resource phase, computed from the aggregate of its node statuses.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Pending,
    Deploying,
    Deployed,
    Failed,
    Deleted,
}

/// A Kubernetes-style condition, with transition bookkeeping grounded on
/// `stackabletech-operator-rs`'s `compute_conditions` (status changes only
/// bump `last_transition_time`; message-only updates do not).
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Applies (or inserts) `new` into `conditions`, bumping `last_transition_time`
/// only when the condition's `status` actually changed.
pub fn upsert_condition(conditions: &mut Vec<Condition>, type_: &str, status: ConditionStatus, reason: &str, message: &str, now: DateTime<Utc>) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let status_changed = existing.status != status;
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        if status_changed {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
        });
    }
}

/// Structured subtree populated only when `security: enabled`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStatus {
    pub scan_status: String,
    pub vulnerabilities: u32,
    pub critical_issues: u32,
}

/// Structured subtree populated only when `observability: enabled`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityStatus {
    pub metrics_collected: bool,
    pub dashboards_available: bool,
    pub alerts_configured: bool,
}

pub const FINALIZER: &str = "herd.suse.com/finalizer";

pub const LABEL_OWNER_KIND: &str = "herd.suse.com/owner-kind";
pub const LABEL_OWNER_NAME: &str = "herd.suse.com/owner-name";
pub const LABEL_OWNER_NAMESPACE: &str = "herd.suse.com/owner-namespace";
pub const LABEL_CHART: &str = "herd.suse.com/chart";
pub const ANNOTATION_CONTENT_HASH: &str = "herd.suse.com/content-hash";
