use std::collections::{BTreeMap, VecDeque};

use crate::crd::common::DeploymentStatus;
use crate::error::{Error, Result};

/// Anything schedulable by name with a `dependsOn` list — `ChartSpec` and
/// `StepSpec` both satisfy this.
pub trait DagNode {
    fn name(&self) -> &str;
    fn depends_on(&self) -> &[String];
}

impl DagNode for crate::crd::stack::ChartSpec {
    fn name(&self) -> &str {
        &self.name
    }
    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

impl DagNode for crate::crd::pipeline::StepSpec {
    fn name(&self) -> &str {
        &self.name
    }
    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

/// Validates the `dependsOn` graph is acyclic and returns a topological order.
/// Assumes names are unique and every `dependsOn` reference is known — both
/// already enforced by `validate_stack`/`validate_pipeline`.
pub fn detect_cycle<N: DagNode>(nodes: &[N]) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = nodes.iter().map(|n| (n.name(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for n in nodes {
        *in_degree.get_mut(n.name()).unwrap() = n.depends_on().len();
        for dep in n.depends_on() {
            dependents.entry(dep.as_str()).or_default().push(n.name());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            for dependent in deps {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let mut remaining: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        remaining.sort();
        return Err(Error::CycleDetected(remaining));
    }

    Ok(order)
}

/// The outcome of one scheduling pass: nodes newly eligible to deploy, and
/// nodes that can never deploy because a dependency failed or was itself
/// blocked — a node whose dependency is `Failed`/`Blocked` is itself
/// `Blocked`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerPlan {
    pub ready: Vec<String>,
    pub blocked: Vec<String>,
}

/// Computes which still-`Pending` nodes are ready to deploy and which are
/// newly blocked, given the current observed status of every node.
/// Nodes absent from `statuses` are treated as `Pending`.
pub fn compute_plan<N: DagNode>(nodes: &[N], statuses: &BTreeMap<String, DeploymentStatus>) -> SchedulerPlan {
    let mut plan = SchedulerPlan::default();

    for node in nodes {
        let current = statuses
            .get(node.name())
            .copied()
            .unwrap_or(DeploymentStatus::Pending);
        if current != DeploymentStatus::Pending {
            continue;
        }

        let dep_statuses: Vec<DeploymentStatus> = node
            .depends_on()
            .iter()
            .map(|dep| statuses.get(dep).copied().unwrap_or(DeploymentStatus::Pending))
            .collect();

        if dep_statuses
            .iter()
            .any(|s| matches!(s, DeploymentStatus::Failed | DeploymentStatus::Blocked))
        {
            plan.blocked.push(node.name().to_string());
        } else if dep_statuses.iter().all(|s| *s == DeploymentStatus::Deployed) {
            plan.ready.push(node.name().to_string());
        }
    }

    plan
}
