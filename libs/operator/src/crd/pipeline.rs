use std::collections::{BTreeMap, BTreeSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::common::{
    Condition, DeploymentObservation, ObservabilityStatus, Phase, SecurityStatus, Targets, Toggle,
    ValuesSpec,
};
use crate::crd::stack::EnvLabel;

/// `Pipeline`: a declarative DAG of typed steps over the same targeting model as `Stack`.
#[derive(Clone, CustomResource, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "herd.suse.com",
    version = "v1",
    kind = "Pipeline",
    plural = "pipelines",
    shortname = "pln",
    namespaced,
    status = "PipelineStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub env: EnvLabel,
    #[serde(default)]
    pub security: Toggle,
    #[serde(default)]
    pub observability: Toggle,
    pub targets: Targets,
    pub steps: Vec<StepSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Ingestion,
    VectorDb,
    Llm,
    Service,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: StepType,
    /// Helm release backing this step; the Bundle synthesizer treats a step
    /// exactly like a Stack chart. `config` below stays opaque to the core;
    /// these coordinates are what make the step a deployable Bundle at all.
    pub release_name: String,
    pub namespace: String,
    pub repo: String,
    pub version: String,
    /// Opaque, type-specific configuration; the core never interprets this payload.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub values: ValuesSpec,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default)]
    pub retries: u32,
}

fn default_timeout() -> String {
    "10m".to_string()
}

impl StepSpec {
    pub fn timeout_duration(&self) -> Result<std::time::Duration, humantime::DurationError> {
        humantime::parse_duration(&self.timeout)
    }
}

pub fn validate_pipeline(spec: &PipelineSpec) -> Result<(), String> {
    if spec.steps.is_empty() {
        return Err("spec.steps must not be empty".to_string());
    }
    spec.targets.validate()?;

    let names: BTreeSet<&str> = spec.steps.iter().map(|s| s.name.as_str()).collect();
    if names.len() != spec.steps.len() {
        return Err("spec.steps[].name must be unique within the Pipeline".to_string());
    }
    for step in &spec.steps {
        for dep in &step.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(format!(
                    "step {:?} dependsOn unknown step {:?}",
                    step.name, dep
                ));
            }
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
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
    /// Transient-timeout retries consumed so far per step name. Cleared once
    /// a step reaches `Deployed`; exhausted once it equals `StepSpec::retries`,
    /// at which point a further timeout is surfaced as a hard `Failed`.
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, depends_on: &[&str]) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            type_: StepType::Ingestion,
            release_name: name.to_string(),
            namespace: "default".to_string(),
            repo: "https://example.com/charts".to_string(),
            version: "1.0.0".to_string(),
            config: serde_json::json!({}),
            values: ValuesSpec::default(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            timeout: default_timeout(),
            retries: 0,
        }
    }

    fn base_spec(steps: Vec<StepSpec>) -> PipelineSpec {
        PipelineSpec {
            env: EnvLabel::Dev,
            security: Toggle(false),
            observability: Toggle(false),
            targets: crate::crd::common::Targets {
                cluster_ids: Some(vec!["c-a".to_string()]),
                selector: None,
            },
            steps,
        }
    }

    #[test]
    fn step_type_serializes_kebab_case() {
        let value = serde_json::to_value(StepType::VectorDb).unwrap();
        assert_eq!(value, serde_json::json!("vector-db"));
    }

    #[test]
    fn rejects_empty_steps() {
        assert!(validate_pipeline(&base_spec(vec![])).is_err());
    }

    #[test]
    fn rejects_unknown_step_type_round_trip() {
        let err = serde_json::from_value::<StepType>(serde_json::json!("unknown"));
        assert!(err.is_err());
    }

    #[test]
    fn accepts_well_formed_pipeline() {
        let spec = base_spec(vec![step("ingest", &[]), step("index", &["ingest"])]);
        assert!(validate_pipeline(&spec).is_ok());
    }
}
