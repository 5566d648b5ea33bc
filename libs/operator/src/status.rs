use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::crd::common::{
    upsert_condition, Condition, ConditionStatus, DeploymentObservation, DeploymentStatus,
    ObservabilityStatus, Phase, SecurityStatus,
};
use crate::fleet::BundleDeployment;

/// Reduces one node's per-cluster observations into the single
/// `DeploymentStatus` the scheduler needs to decide readiness: `Deployed`
/// only once every cluster has reached it, `Failed` if any cluster reports
/// it, `Blocked` if any cluster reports it and none `Failed`, `Deploying`
/// otherwise. A node with no observations yet is `Pending`.
pub fn gating_status(observations: &[DeploymentObservation], node_name: &str) -> DeploymentStatus {
    let mine: Vec<&DeploymentObservation> = observations
        .iter()
        .filter(|o| o.chart_name == node_name)
        .collect();
    if mine.is_empty() {
        return DeploymentStatus::Pending;
    }
    if mine.iter().any(|o| o.status == DeploymentStatus::Failed) {
        DeploymentStatus::Failed
    } else if mine.iter().any(|o| o.status == DeploymentStatus::Blocked) {
        DeploymentStatus::Blocked
    } else if mine.iter().all(|o| o.status == DeploymentStatus::Deployed) {
        DeploymentStatus::Deployed
    } else {
        DeploymentStatus::Deploying
    }
}

/// Builds the `{nodeName -> DeploymentStatus}` map the scheduler consumes,
/// for every declared node (absent nodes default to `Pending` inside
/// `compute_plan`, so this only needs to cover ones we have data for).
pub fn gating_statuses(
    observations: &[DeploymentObservation],
    node_names: &[String],
) -> BTreeMap<String, DeploymentStatus> {
    node_names
        .iter()
        .map(|n| (n.clone(), gating_status(observations, n)))
        .collect()
}

/// Rolls up per-node gating statuses into the parent's overall phase: `Failed`
/// if any node failed, `Deployed` only once every node has, `Deploying` once
/// any node has started, else `Pending`.
pub fn compute_phase(gating: &BTreeMap<String, DeploymentStatus>, total_nodes: usize) -> Phase {
    if gating.values().any(|s| *s == DeploymentStatus::Failed) {
        return Phase::Failed;
    }
    if total_nodes > 0
        && gating.len() == total_nodes
        && gating.values().all(|s| *s == DeploymentStatus::Deployed)
    {
        return Phase::Deployed;
    }
    if gating
        .values()
        .any(|s| matches!(s, DeploymentStatus::Deploying | DeploymentStatus::Deployed))
    {
        return Phase::Deploying;
    }
    Phase::Pending
}

/// Applies the `Ready` condition (and, when the corresponding toggle is on,
/// `SecurityScanned`/`ObservabilityConfigured`) onto `conditions`, bumping
/// `last_transition_time` only on an actual status change (`upsert_condition`,
/// grounded on `stackabletech-operator-rs`'s `compute_conditions`).
///
/// `reason_override` lets a permanent-failure caller supply the triggering
/// error's own reason (e.g. `CycleDetected`, `NoTargets`) instead of the
/// generic per-phase reason below.
#[allow(clippy::too_many_arguments)]
pub fn apply_conditions(
    conditions: &mut Vec<Condition>,
    phase: Phase,
    message: &str,
    reason_override: Option<&str>,
    security_enabled: bool,
    observability_enabled: bool,
    security: Option<&SecurityStatus>,
    observability: Option<&ObservabilityStatus>,
    now: DateTime<Utc>,
) {
    let (ready_status, default_reason) = match phase {
        Phase::Deployed => (ConditionStatus::True, "Deployed"),
        Phase::Failed => (ConditionStatus::False, "Failed"),
        Phase::Deploying => (ConditionStatus::False, "Deploying"),
        Phase::Pending => (ConditionStatus::False, "Pending"),
        Phase::Deleted => (ConditionStatus::False, "Deleted"),
    };
    let ready_reason = reason_override.unwrap_or(default_reason);
    upsert_condition(conditions, "Ready", ready_status, ready_reason, message, now);

    if security_enabled {
        let scanned = security.map(|s| s.scan_status == "Completed").unwrap_or(false);
        let (status, reason) = if scanned {
            (ConditionStatus::True, "Scanned")
        } else {
            (ConditionStatus::Unknown, "Pending")
        };
        upsert_condition(conditions, "SecurityScanned", status, reason, "security scan status", now);
    }

    if observability_enabled {
        let configured = observability
            .map(|o| o.dashboards_available && o.alerts_configured)
            .unwrap_or(false);
        let (status, reason) = if configured {
            (ConditionStatus::True, "Configured")
        } else {
            (ConditionStatus::Unknown, "Pending")
        };
        upsert_condition(conditions, "ObservabilityConfigured", status, reason, "observability status", now);
    }
}

/// Builds this tick's observations for one node across its resolved
/// clusters, reading back `BundleDeployment` status. The first-observed
/// timestamp for a (node, cluster) pair is carried forward from `previous` so
/// `check_timeout` can measure elapsed time since the node first became
/// `Deploying`, not since this reconciliation started.
pub fn observe_node(
    node_name: &str,
    cluster_ids: &[String],
    bundle_deployments: &[BundleDeployment],
    previous: &[DeploymentObservation],
    now: DateTime<Utc>,
) -> Vec<DeploymentObservation> {
    cluster_ids
        .iter()
        .map(|cluster_id| {
            let bd = bundle_deployments
                .iter()
                .find(|d| &d.spec.cluster_id == cluster_id);
            let status = match bd {
                Some(d) if d.status.as_ref().map(|s| s.ready).unwrap_or(false) => DeploymentStatus::Deployed,
                _ => DeploymentStatus::Deploying,
            };
            let message = bd
                .and_then(|d| d.status.as_ref())
                .map(|s| s.message.clone())
                .filter(|m| !m.is_empty());
            let first_observed = previous
                .iter()
                .find(|o| o.chart_name == node_name && &o.cluster_id == cluster_id)
                .and_then(|o| o.last_updated)
                .unwrap_or(now);
            DeploymentObservation {
                chart_name: node_name.to_string(),
                cluster_id: cluster_id.clone(),
                status,
                last_updated: Some(first_observed),
                message,
            }
        })
        .collect()
}

/// True once a node's first-applied timestamp is older than `timeout`,
/// regardless of whether `wait` requested blocking — the timer always runs,
/// `wait` only controls whether dependents block on it.
pub fn check_timeout(first_applied_at: Option<DateTime<Utc>>, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
    match first_applied_at {
        Some(t) => now
            .signed_duration_since(t)
            .to_std()
            .map(|elapsed| elapsed >= timeout)
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(chart: &str, cluster: &str, status: DeploymentStatus) -> DeploymentObservation {
        DeploymentObservation {
            chart_name: chart.to_string(),
            cluster_id: cluster.to_string(),
            status,
            last_updated: None,
            message: None,
        }
    }

    #[test]
    fn gating_status_requires_every_cluster_deployed() {
        let observations = vec![
            obs("a", "c1", DeploymentStatus::Deployed),
            obs("a", "c2", DeploymentStatus::Deploying),
        ];
        assert_eq!(gating_status(&observations, "a"), DeploymentStatus::Deploying);
    }

    #[test]
    fn gating_status_failed_cluster_wins_over_deploying() {
        let observations = vec![
            obs("a", "c1", DeploymentStatus::Failed),
            obs("a", "c2", DeploymentStatus::Deploying),
        ];
        assert_eq!(gating_status(&observations, "a"), DeploymentStatus::Failed);
    }

    #[test]
    fn gating_status_absent_node_is_pending() {
        assert_eq!(gating_status(&[], "ghost"), DeploymentStatus::Pending);
    }

    #[test]
    fn compute_phase_failed_dominates() {
        let gating = BTreeMap::from([
            ("a".to_string(), DeploymentStatus::Deployed),
            ("b".to_string(), DeploymentStatus::Failed),
        ]);
        assert_eq!(compute_phase(&gating, 2), Phase::Failed);
    }

    #[test]
    fn compute_phase_deployed_requires_all_nodes_accounted_for() {
        let gating = BTreeMap::from([("a".to_string(), DeploymentStatus::Deployed)]);
        assert_eq!(compute_phase(&gating, 2), Phase::Deploying);
        let gating = BTreeMap::from([
            ("a".to_string(), DeploymentStatus::Deployed),
            ("b".to_string(), DeploymentStatus::Deployed),
        ]);
        assert_eq!(compute_phase(&gating, 2), Phase::Deployed);
    }

    #[test]
    fn compute_phase_no_nodes_is_pending() {
        assert_eq!(compute_phase(&BTreeMap::new(), 0), Phase::Pending);
    }

    #[test]
    fn check_timeout_respects_elapsed_duration() {
        let t0 = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let t1 = DateTime::parse_from_rfc3339("2026-01-01T00:11:00Z").unwrap().with_timezone(&Utc);
        assert!(!check_timeout(Some(t0), std::time::Duration::from_secs(600), t0));
        assert!(check_timeout(Some(t0), std::time::Duration::from_secs(600), t1));
        assert!(!check_timeout(None, std::time::Duration::from_secs(600), t1));
    }
}
