use std::collections::BTreeSet;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::crd::common::{BundleKey, FleetWorkspace, LABEL_CHART, LABEL_OWNER_KIND, LABEL_OWNER_NAME, LABEL_OWNER_NAMESPACE};
use crate::error::Result;
use crate::fleet::{BundleSpec, BundleTarget, FleetClient, HelmOptions};

/// Synthesizes and applies Fleet Bundles for one owner (`Stack`/`Pipeline`).
/// Left as a trait so a future Rancher-Apps-v2 backend can be swapped in
/// without touching the reconciler.
#[async_trait]
pub trait BundleSynthesizer: Send + Sync {
    /// Computes the desired Bundle for one chart/step across its resolved
    /// clusters and applies it if its content differs from what's stored.
    /// Returns `true` if a write was performed.
    async fn sync_chart(
        &self,
        owner_kind: &str,
        owner_namespace: &str,
        owner_name: &str,
        chart_name: &str,
        workspace: FleetWorkspace,
        helm: HelmOptions,
        targets: Vec<BundleTarget>,
        timeout_seconds: Option<u64>,
    ) -> Result<bool>;

    /// Deletes any Bundle owned by this resource in `workspace` whose
    /// chart/step name is no longer present in `expected_chart_names` — covers
    /// both a chart being removed from the resource and full teardown on
    /// deletion (called with an empty set). Scoped to a single workspace so a
    /// chart that moved from one workspace to another leaves no stale Bundle
    /// behind in the one it vacated; callers reap every workspace on each
    /// reconcile. Returns the names of charts/steps that were reaped.
    async fn reap(
        &self,
        owner_kind: &str,
        owner_namespace: &str,
        owner_name: &str,
        workspace: FleetWorkspace,
        expected_chart_names: &BTreeSet<String>,
    ) -> Result<Vec<String>>;
}

pub struct FleetBundleSynthesizer<'a> {
    client: &'a dyn FleetClient,
}

impl<'a> FleetBundleSynthesizer<'a> {
    pub fn new(client: &'a dyn FleetClient) -> Self {
        Self { client }
    }
}

fn content_hash(spec: &BundleSpec) -> String {
    let bytes = serde_json::to_vec(spec).expect("BundleSpec always serializes");
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

#[async_trait]
impl<'a> BundleSynthesizer for FleetBundleSynthesizer<'a> {
    async fn sync_chart(
        &self,
        owner_kind: &str,
        owner_namespace: &str,
        owner_name: &str,
        chart_name: &str,
        workspace: FleetWorkspace,
        helm: HelmOptions,
        targets: Vec<BundleTarget>,
        timeout_seconds: Option<u64>,
    ) -> Result<bool> {
        let key = BundleKey::new(owner_kind, owner_name, chart_name, workspace);
        let spec = BundleSpec {
            helm,
            targets,
            timeout_seconds,
        };
        let hash = content_hash(&spec);

        let mut labels = std::collections::BTreeMap::new();
        labels.insert(LABEL_OWNER_KIND.to_string(), owner_kind.to_string());
        labels.insert(LABEL_OWNER_NAME.to_string(), owner_name.to_string());
        labels.insert(LABEL_OWNER_NAMESPACE.to_string(), owner_namespace.to_string());
        labels.insert(LABEL_CHART.to_string(), chart_name.to_string());

        self.client
            .apply_bundle(&key.namespace, &key.name, spec, labels, &hash)
            .await
    }

    async fn reap(
        &self,
        owner_kind: &str,
        owner_namespace: &str,
        owner_name: &str,
        workspace: FleetWorkspace,
        expected_chart_names: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let owned = self
            .client
            .list_owned_bundles(owner_kind, owner_namespace, owner_name, workspace)
            .await?;

        let mut reaped = Vec::new();
        for bundle in owned {
            let chart_name = bundle
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_CHART))
                .cloned();
            let Some(chart_name) = chart_name else { continue };
            if expected_chart_names.contains(&chart_name) {
                continue;
            }
            let (Some(namespace), Some(name)) = (bundle.metadata.namespace.as_deref(), bundle.metadata.name.as_deref()) else {
                continue;
            };
            self.client.delete_bundle(namespace, name).await?;
            reaped.push(chart_name);
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::fake::FakeFleetClient;

    fn helm(chart: &str) -> HelmOptions {
        HelmOptions {
            repo: "https://example.com/charts".to_string(),
            chart: chart.to_string(),
            version: "1.0.0".to_string(),
            release_name: chart.to_string(),
            namespace: "default".to_string(),
        }
    }

    fn target(cluster_id: &str) -> BundleTarget {
        BundleTarget {
            cluster_id: cluster_id.to_string(),
            values: serde_json::json!({"a": 1}),
        }
    }

    #[tokio::test]
    async fn sync_chart_applies_on_first_call() {
        let client = FakeFleetClient::default();
        let synth = FleetBundleSynthesizer::new(&client);
        let applied = synth
            .sync_chart("Stack", "ns", "my-stack", "app", FleetWorkspace::FleetDefault, helm("app"), vec![target("c-a")], None)
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(client.bundle_count(), 1);
        assert_eq!(client.apply_calls(), 1);
    }

    #[tokio::test]
    async fn sync_chart_is_idempotent_on_unchanged_content() {
        let client = FakeFleetClient::default();
        let synth = FleetBundleSynthesizer::new(&client);
        synth
            .sync_chart("Stack", "ns", "my-stack", "app", FleetWorkspace::FleetDefault, helm("app"), vec![target("c-a")], None)
            .await
            .unwrap();
        let applied_again = synth
            .sync_chart("Stack", "ns", "my-stack", "app", FleetWorkspace::FleetDefault, helm("app"), vec![target("c-a")], None)
            .await
            .unwrap();
        assert!(!applied_again);
        assert_eq!(client.apply_calls(), 1);
    }

    #[tokio::test]
    async fn sync_chart_reapplies_on_changed_values() {
        let client = FakeFleetClient::default();
        let synth = FleetBundleSynthesizer::new(&client);
        synth
            .sync_chart("Stack", "ns", "my-stack", "app", FleetWorkspace::FleetDefault, helm("app"), vec![target("c-a")], None)
            .await
            .unwrap();
        let applied_again = synth
            .sync_chart("Stack", "ns", "my-stack", "app", FleetWorkspace::FleetDefault, helm("app"), vec![target("c-b")], None)
            .await
            .unwrap();
        assert!(applied_again);
        assert_eq!(client.apply_calls(), 2);
    }

    #[tokio::test]
    async fn reap_removes_bundles_for_charts_no_longer_in_spec() {
        let client = FakeFleetClient::default();
        let synth = FleetBundleSynthesizer::new(&client);
        synth
            .sync_chart("Stack", "ns", "my-stack", "app", FleetWorkspace::FleetDefault, helm("app"), vec![target("c-a")], None)
            .await
            .unwrap();
        synth
            .sync_chart("Stack", "ns", "my-stack", "db", FleetWorkspace::FleetDefault, helm("db"), vec![target("c-a")], None)
            .await
            .unwrap();

        let mut expected = BTreeSet::new();
        expected.insert("app".to_string());
        let reaped = synth
            .reap("Stack", "ns", "my-stack", FleetWorkspace::FleetDefault, &expected)
            .await
            .unwrap();
        assert_eq!(reaped, vec!["db".to_string()]);
        assert_eq!(client.bundle_count(), 1);
    }

    #[tokio::test]
    async fn reap_with_empty_expected_set_removes_everything() {
        let client = FakeFleetClient::default();
        let synth = FleetBundleSynthesizer::new(&client);
        synth
            .sync_chart("Stack", "ns", "my-stack", "app", FleetWorkspace::FleetDefault, helm("app"), vec![target("c-a")], None)
            .await
            .unwrap();
        let reaped = synth
            .reap("Stack", "ns", "my-stack", FleetWorkspace::FleetDefault, &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(reaped, vec!["app".to_string()]);
        assert_eq!(client.bundle_count(), 0);
    }

    #[tokio::test]
    async fn reap_is_scoped_to_its_own_workspace() {
        let client = FakeFleetClient::default();
        let synth = FleetBundleSynthesizer::new(&client);
        synth
            .sync_chart("Stack", "ns", "my-stack", "app", FleetWorkspace::FleetLocal, helm("app"), vec![target("c-a")], None)
            .await
            .unwrap();
        synth
            .sync_chart("Stack", "ns", "my-stack", "db", FleetWorkspace::FleetDefault, helm("db"), vec![target("c-b")], None)
            .await
            .unwrap();

        let reaped = synth
            .reap("Stack", "ns", "my-stack", FleetWorkspace::FleetDefault, &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(reaped, vec!["db".to_string()]);
        assert_eq!(client.bundle_count(), 1, "the fleet-local Bundle must survive a fleet-default reap");
    }
}
