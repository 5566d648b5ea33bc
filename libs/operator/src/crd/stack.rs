use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{
    Condition, DeploymentObservation, ObservabilityStatus, Phase, SecurityStatus, Targets, Toggle,
    ValuesSpec,
};

/// `Stack`: a declarative bundle of Helm charts to deploy across a set of clusters.
#[derive(Clone, CustomResource, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "herd.suse.com",
    version = "v1",
    kind = "Stack",
    plural = "stacks",
    shortname = "stk",
    namespaced,
    status = "StackStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// Selects the implicit env-overlay ConfigMap `herd-env-{env}`.
    pub env: EnvLabel,
    #[serde(default)]
    pub security: Toggle,
    #[serde(default)]
    pub observability: Toggle,
    pub targets: Targets,
    pub charts: Vec<ChartSpec>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvLabel {
    Dev,
    Staging,
    Prod,
}

impl EnvLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvLabel::Dev => "dev",
            EnvLabel::Staging => "staging",
            EnvLabel::Prod => "prod",
        }
    }

    /// Name of the implicit environment-overlay ConfigMap for this environment.
    pub fn overlay_config_map_name(&self) -> String {
        format!("herd-env-{}", self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    pub name: String,
    pub release_name: String,
    pub namespace: String,
    pub repo: String,
    pub version: String,
    #[serde(default)]
    pub values: ValuesSpec,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub wait: bool,
    /// A `humantime`-parseable duration string, e.g. `"10m"`. Defaults to 10 minutes.
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

fn default_timeout() -> String {
    "10m".to_string()
}

impl ChartSpec {
    pub fn timeout_duration(&self) -> Result<std::time::Duration, humantime::DurationError> {
        humantime::parse_duration(&self.timeout)
    }
}

/// Validates the Stack-level invariants: non-empty `charts`, exactly one
/// `targets` form, and (transitively) a cycle-free `dependsOn` graph — cycle
/// detection itself lives in the scheduler.
pub fn validate_stack(spec: &StackSpec) -> Result<(), String> {
    if spec.charts.is_empty() {
        return Err("spec.charts must not be empty".to_string());
    }
    spec.targets.validate()?;

    let names: BTreeSet<&str> = spec.charts.iter().map(|c| c.name.as_str()).collect();
    if names.len() != spec.charts.len() {
        return Err("spec.charts[].name must be unique within the Stack".to_string());
    }
    for chart in &spec.charts {
        for dep in &chart.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(format!(
                    "chart {:?} dependsOn unknown chart {:?}",
                    chart.name, dep
                ));
            }
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub deployments: Vec<DeploymentObservation>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub target_clusters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::LabelSelectorSpec;

    fn chart(name: &str, depends_on: &[&str]) -> ChartSpec {
        ChartSpec {
            name: name.to_string(),
            release_name: name.to_string(),
            namespace: "default".to_string(),
            repo: "https://example.com/charts".to_string(),
            version: "1.0.0".to_string(),
            values: ValuesSpec::default(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            wait: false,
            timeout: default_timeout(),
        }
    }

    fn base_spec(charts: Vec<ChartSpec>) -> StackSpec {
        StackSpec {
            env: EnvLabel::Dev,
            security: Toggle(false),
            observability: Toggle(false),
            targets: Targets {
                cluster_ids: Some(vec!["c-a".to_string()]),
                selector: None,
            },
            charts,
        }
    }

    #[test]
    fn rejects_empty_charts() {
        let spec = base_spec(vec![]);
        assert!(validate_stack(&spec).is_err());
    }

    #[test]
    fn rejects_duplicate_chart_names() {
        let spec = base_spec(vec![chart("a", &[]), chart("a", &[])]);
        assert!(validate_stack(&spec).is_err());
    }

    #[test]
    fn rejects_unknown_depends_on() {
        let spec = base_spec(vec![chart("a", &["ghost"])]);
        assert!(validate_stack(&spec).is_err());
    }

    #[test]
    fn rejects_both_targets_forms() {
        let mut spec = base_spec(vec![chart("a", &[])]);
        spec.targets.selector = Some(LabelSelectorSpec::default());
        assert!(validate_stack(&spec).is_err());
    }

    #[test]
    fn accepts_well_formed_spec() {
        let spec = base_spec(vec![chart("a", &[]), chart("b", &["a"])]);
        assert!(validate_stack(&spec).is_ok());
    }
}
