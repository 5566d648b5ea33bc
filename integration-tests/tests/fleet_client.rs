#![cfg(feature = "integration-tests")]

use std::collections::BTreeMap;

use herd_operator::fleet::{FleetClient, HelmOptions, KubeFleetClient};
use herd_operator::synthesizer::{BundleSynthesizer, FleetBundleSynthesizer};
use kube::client::Client;

fn helm_options(chart: &str) -> HelmOptions {
    HelmOptions {
        repo: "https://charts.example.com".to_string(),
        chart: chart.to_string(),
        version: "1.0.0".to_string(),
        release_name: chart.to_string(),
        namespace: "default".to_string(),
    }
}

// Exercises the real `KubeFleetClient` against a live apiserver with the
// Fleet CRDs installed: applying a Bundle twice with identical content is a
// no-op the second time (content-hash idempotence).
#[tokio::test]
async fn apply_bundle_is_idempotent_on_unchanged_content() {
    let client = Client::try_default().await.unwrap();
    let fleet = KubeFleetClient::new(client);

    let helm = helm_options("idempotence-check");
    let spec = herd_operator::fleet::types::BundleSpec {
        helm: helm.clone(),
        targets: vec![],
        timeout_seconds: None,
    };
    // The real hash algorithm is an implementation detail of the synthesizer;
    // `apply_bundle` only cares that the annotation value is stable across calls.
    let hash = "integration-test-fixed-hash".to_string();
    let labels = BTreeMap::new();

    let first = fleet
        .apply_bundle("fleet-default", "integration-test-bundle", spec.clone(), labels.clone(), &hash)
        .await
        .unwrap();
    assert!(first, "first apply with new content must write");

    let second = fleet
        .apply_bundle("fleet-default", "integration-test-bundle", spec, labels, &hash)
        .await
        .unwrap();
    assert!(!second, "re-applying identical content must be a no-op");

    fleet
        .delete_bundle("fleet-default", "integration-test-bundle")
        .await
        .unwrap();
}

// The synthesizer's reap only deletes Bundles whose chart label fell out of
// the expected set.
#[tokio::test]
async fn reap_deletes_only_bundles_outside_expected_set() {
    let client = Client::try_default().await.unwrap();
    let fleet = KubeFleetClient::new(client);
    let synthesizer = FleetBundleSynthesizer::new(&fleet);

    synthesizer
        .sync_chart(
            "Stack",
            "fleet-default",
            "reap-check",
            "kept",
            herd_operator::crd::common::FleetWorkspace::FleetDefault,
            helm_options("kept"),
            vec![],
            None,
        )
        .await
        .unwrap();
    synthesizer
        .sync_chart(
            "Stack",
            "fleet-default",
            "reap-check",
            "removed",
            herd_operator::crd::common::FleetWorkspace::FleetDefault,
            helm_options("removed"),
            vec![],
            None,
        )
        .await
        .unwrap();

    let expected = std::collections::BTreeSet::from(["kept".to_string()]);
    synthesizer
        .reap(
            "Stack",
            "fleet-default",
            "reap-check",
            herd_operator::crd::common::FleetWorkspace::FleetDefault,
            &expected,
        )
        .await
        .unwrap();

    let remaining = fleet
        .list_owned_bundles("Stack", "fleet-default", "reap-check", herd_operator::crd::common::FleetWorkspace::FleetDefault)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].metadata.labels.as_ref().unwrap()["herd.suse.com/chart"], "kept");

    synthesizer
        .reap(
            "Stack",
            "fleet-default",
            "reap-check",
            herd_operator::crd::common::FleetWorkspace::FleetDefault,
            &std::collections::BTreeSet::new(),
        )
        .await
        .unwrap();
}
