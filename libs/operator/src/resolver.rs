use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::crd::common::{FleetWorkspace, ResolvedCluster, Targets};
use crate::error::{Error, Result};
use crate::fleet::{ClusterInfo, FleetClient};

/// Classifies a cluster into its Fleet workspace. Rancher's management
/// cluster is conventionally named `local`; every other cluster lands in
/// `fleet-default`.
fn classify_workspace(cluster_id: &str) -> FleetWorkspace {
    if cluster_id == "local" {
        FleetWorkspace::FleetLocal
    } else {
        FleetWorkspace::FleetDefault
    }
}

fn matches_selector(cluster: &ClusterInfo, match_labels: &std::collections::BTreeMap<String, String>) -> bool {
    match_labels
        .iter()
        .all(|(k, v)| cluster.labels.get(k) == Some(v))
}

/// Turns a `targets` specification into a concrete, deterministically sorted
/// set of resolved clusters.
///
/// * `clusterIds`: each id is checked against the inventory. Unknown ids are
///   warned about but do not fail the resolution as long as at least one
///   valid cluster remains; zero valid clusters is `NoTargets`.
/// * `selector`: every *active* cluster whose labels are a superset of
///   `matchLabels` is retained.
pub async fn resolve(client: &dyn FleetClient, targets: &Targets) -> Result<Vec<ResolvedCluster>> {
    let inventory = client.list_clusters().await?;

    let mut resolved: Vec<ResolvedCluster> = match (&targets.cluster_ids, &targets.selector) {
        (Some(ids), None) => {
            let mut found = Vec::new();
            for id in ids {
                match inventory.iter().find(|c| &c.id == id) {
                    Some(cluster) if cluster.is_active() => {
                        found.push(ResolvedCluster {
                            id: cluster.id.clone(),
                            labels: cluster.labels.clone(),
                            workspace: classify_workspace(&cluster.id),
                        });
                    }
                    Some(cluster) => {
                        warn!(cluster_id = %id, state = %cluster.state, "cluster is not active, excluding from targets");
                    }
                    None => {
                        warn!(cluster_id = %id, "unknown cluster id in targets.clusterIds");
                    }
                }
            }
            found
        }
        (None, Some(selector)) => inventory
            .iter()
            .filter(|c| c.is_active() && matches_selector(c, &selector.match_labels))
            .map(|c| ResolvedCluster {
                id: c.id.clone(),
                labels: c.labels.clone(),
                workspace: classify_workspace(&c.id),
            })
            .collect(),
        _ => {
            return Err(Error::ValidationFailure(
                "targets: exactly one of clusterIds/selector must be set".to_string(),
            ))
        }
    };

    if resolved.is_empty() {
        return Err(Error::NoTargets(
            "no clusters matched the given targets".to_string(),
        ));
    }

    // Sort by cluster id so downstream Bundle generation is stable across
    // reconciliations.
    resolved.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(resolved)
}

/// Convenience wrapper over an `Arc<dyn FleetClient>`, used by reconcilers.
pub async fn resolve_arc(client: &Arc<dyn FleetClient>, targets: &Targets) -> Result<Vec<ResolvedCluster>> {
    resolve(client.as_ref(), targets).await
}

/// Groups resolved clusters by their Fleet workspace, so a caller can emit one
/// Bundle per workspace instead of collapsing a spanning target set into one.
/// Deterministic iteration order (`BTreeMap`) keeps Bundle application order
/// stable across reconciliations.
pub fn group_by_workspace(clusters: &[ResolvedCluster]) -> BTreeMap<FleetWorkspace, Vec<ResolvedCluster>> {
    let mut groups: BTreeMap<FleetWorkspace, Vec<ResolvedCluster>> = BTreeMap::new();
    for cluster in clusters {
        groups.entry(cluster.workspace).or_default().push(cluster.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::LabelSelectorSpec;
    use crate::fleet::fake::FakeFleetClient;
    use std::collections::BTreeMap;

    fn cluster(id: &str, state: &str, labels: &[(&str, &str)]) -> ClusterInfo {
        ClusterInfo {
            id: id.to_string(),
            state: state.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[tokio::test]
    async fn resolves_explicit_cluster_ids() {
        let client = FakeFleetClient::with_clusters(vec![cluster("c-a", "active", &[])]);
        let targets = Targets { cluster_ids: Some(vec!["c-a".to_string()]), selector: None };
        let resolved = resolve(&client, &targets).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "c-a");
        assert_eq!(resolved[0].workspace, FleetWorkspace::FleetDefault);
    }

    #[tokio::test]
    async fn unknown_id_is_warning_not_failure_if_others_valid() {
        let client = FakeFleetClient::with_clusters(vec![cluster("c-a", "active", &[])]);
        let targets = Targets {
            cluster_ids: Some(vec!["c-a".to_string(), "c-ghost".to_string()]),
            selector: None,
        };
        let resolved = resolve(&client, &targets).await.unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[tokio::test]
    async fn all_unknown_ids_yields_no_targets() {
        let client = FakeFleetClient::with_clusters(vec![]);
        let targets = Targets { cluster_ids: Some(vec!["c-ghost".to_string()]), selector: None };
        let err = resolve(&client, &targets).await.unwrap_err();
        assert!(matches!(err, Error::NoTargets(_)));
    }

    #[tokio::test]
    async fn selector_retains_superset_matches_only() {
        let client = FakeFleetClient::with_clusters(vec![
            cluster("c-a", "active", &[("env", "prod"), ("gpu", "true")]),
            cluster("c-b", "active", &[("env", "prod")]),
            cluster("c-c", "active", &[("env", "dev"), ("gpu", "true")]),
        ]);
        let mut match_labels = BTreeMap::new();
        match_labels.insert("env".to_string(), "prod".to_string());
        match_labels.insert("gpu".to_string(), "true".to_string());
        let targets = Targets {
            cluster_ids: None,
            selector: Some(LabelSelectorSpec { match_labels }),
        };
        let resolved = resolve(&client, &targets).await.unwrap();
        assert_eq!(resolved.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["c-a"]);
    }

    #[tokio::test]
    async fn inactive_clusters_excluded_from_selector() {
        let client = FakeFleetClient::with_clusters(vec![cluster("c-a", "provisioning", &[("env", "prod")])]);
        let mut match_labels = BTreeMap::new();
        match_labels.insert("env".to_string(), "prod".to_string());
        let targets = Targets {
            cluster_ids: None,
            selector: Some(LabelSelectorSpec { match_labels }),
        };
        let err = resolve(&client, &targets).await.unwrap_err();
        assert!(matches!(err, Error::NoTargets(_)));
    }

    #[tokio::test]
    async fn resolution_is_stable_across_calls() {
        let client = FakeFleetClient::with_clusters(vec![
            cluster("c-b", "active", &[]),
            cluster("c-a", "active", &[]),
        ]);
        let targets = Targets {
            cluster_ids: Some(vec!["c-a".to_string(), "c-b".to_string()]),
            selector: None,
        };
        let first = resolve(&client, &targets).await.unwrap();
        let second = resolve(&client, &targets).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["c-a", "c-b"]);
    }

    #[tokio::test]
    async fn local_cluster_classified_fleet_local() {
        let client = FakeFleetClient::with_clusters(vec![cluster("local", "active", &[])]);
        let targets = Targets { cluster_ids: Some(vec!["local".to_string()]), selector: None };
        let resolved = resolve(&client, &targets).await.unwrap();
        assert_eq!(resolved[0].workspace, FleetWorkspace::FleetLocal);
    }

    #[test]
    fn group_by_workspace_splits_spanning_targets() {
        let clusters = vec![
            ResolvedCluster { id: "local".to_string(), labels: BTreeMap::new(), workspace: FleetWorkspace::FleetLocal },
            ResolvedCluster { id: "c-a".to_string(), labels: BTreeMap::new(), workspace: FleetWorkspace::FleetDefault },
            ResolvedCluster { id: "c-b".to_string(), labels: BTreeMap::new(), workspace: FleetWorkspace::FleetDefault },
        ];
        let groups = group_by_workspace(&clusters);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&FleetWorkspace::FleetLocal].len(), 1);
        assert_eq!(groups[&FleetWorkspace::FleetDefault].len(), 2);
    }

    #[test]
    fn group_by_workspace_of_empty_clusters_is_empty() {
        assert!(group_by_workspace(&[]).is_empty());
    }
}
