#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use herd_operator::crd::common::{ConditionStatus, Phase, Targets, Toggle, ValuesSpec};
    use herd_operator::crd::stack::{ChartSpec, EnvLabel, Stack, StackSpec};
    use herd_operator::fleet::Bundle;
    use kube::api::{Api, DeleteParams, ListParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use tokio::time::timeout;

    fn is_stack_phase(phase: Phase) -> impl Condition<Stack> {
        move |obj: Option<&Stack>| {
            obj.and_then(|s| s.status.as_ref())
                .map(|s| s.phase == phase)
                .unwrap_or(false)
        }
    }

    fn is_stack_ready() -> impl Condition<Stack> {
        |obj: Option<&Stack>| {
            obj.and_then(|s| s.status.as_ref())
                .map(|s| {
                    s.conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == ConditionStatus::True)
                })
                .unwrap_or(false)
        }
    }

    async fn wait_for<C>(api: Api<Stack>, name: &str, condition: C)
    where
        C: Condition<Stack>,
    {
        timeout(Duration::from_secs(60), await_condition(api, name, condition))
            .await
            .unwrap()
            .unwrap();
    }

    fn chart(name: &str, depends_on: &[&str], wait: bool) -> ChartSpec {
        ChartSpec {
            name: name.to_string(),
            release_name: name.to_string(),
            namespace: "default".to_string(),
            repo: "https://charts.example.com".to_string(),
            version: "1.0.0".to_string(),
            values: ValuesSpec::default(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            wait,
            timeout: "2m".to_string(),
        }
    }

    fn stack(name: &str, charts: Vec<ChartSpec>) -> Stack {
        Stack::new(
            name,
            StackSpec {
                env: EnvLabel::Dev,
                security: Toggle(false),
                observability: Toggle(false),
                targets: Targets {
                    cluster_ids: Some(vec!["c-a".to_string()]),
                    selector: None,
                },
                charts,
            },
        )
    }

    // S1: single cluster, one chart — reaches Deployed.
    #[tokio::test]
    async fn stack_single_chart_reaches_deployed() {
        let name = "e2e-single-chart";
        let client = Client::try_default().await.unwrap();
        let stacks = Api::<Stack>::namespaced(client, "default");

        stacks
            .create(&PostParams::default(), &stack(name, vec![chart("x", &[], false)]))
            .await
            .unwrap();

        wait_for(stacks.clone(), name, is_stack_phase(Phase::Deployed)).await;
        wait_for(stacks.clone(), name, is_stack_ready()).await;

        stacks.delete(name, &DeleteParams::default()).await.unwrap();
    }

    // S3: DAG with wait — B (dependsOn A, wait:true) is not applied until A reports
    // Ready, and C is not applied until B is Ready.
    #[tokio::test]
    async fn stack_dependent_chart_waits_for_dependency() {
        let name = "e2e-dag-wait";
        let client = Client::try_default().await.unwrap();
        let stacks = Api::<Stack>::namespaced(client, "default");

        let charts = vec![
            chart("a", &[], false),
            chart("b", &["a"], true),
            chart("c", &["b"], false),
        ];
        stacks
            .create(&PostParams::default(), &stack(name, charts))
            .await
            .unwrap();

        wait_for(stacks.clone(), name, is_stack_phase(Phase::Deployed)).await;

        let deployed = stacks.get(name).await.unwrap();
        let status = deployed.status.unwrap();
        assert!(status.deployments.iter().all(|d| d.status == herd_operator::crd::common::DeploymentStatus::Deployed));

        stacks.delete(name, &DeleteParams::default()).await.unwrap();
    }

    // S6: deletion — all owned Bundles are reaped, finalizer removed, resource disappears.
    #[tokio::test]
    async fn stack_deletion_reaps_bundles() {
        let name = "e2e-deletion";
        let client = Client::try_default().await.unwrap();
        let stacks = Api::<Stack>::namespaced(client.clone(), "default");
        let bundles = Api::<Bundle>::namespaced(client, "fleet-default");

        let charts = vec![chart("a", &[], false), chart("b", &[], false), chart("c", &[], false)];
        stacks
            .create(&PostParams::default(), &stack(name, charts))
            .await
            .unwrap();
        wait_for(stacks.clone(), name, is_stack_phase(Phase::Deployed)).await;

        let owned = bundles
            .list(&ListParams::default().labels(&format!(
                "{}={},{}={}",
                herd_operator::crd::common::LABEL_OWNER_KIND,
                "Stack",
                herd_operator::crd::common::LABEL_OWNER_NAME,
                name,
            )))
            .await
            .unwrap();
        assert_eq!(owned.items.len(), 3);

        let uid = stacks.get(name).await.unwrap().uid().unwrap();
        stacks.delete(name, &DeleteParams::default()).await.unwrap();
        timeout(
            Duration::from_secs(60),
            await_condition(stacks.clone(), name, conditions::is_deleted(&uid)),
        )
        .await
        .unwrap()
        .unwrap();

        let remaining = bundles
            .list(&ListParams::default().labels(&format!(
                "{}={},{}={}",
                herd_operator::crd::common::LABEL_OWNER_KIND,
                "Stack",
                herd_operator::crd::common::LABEL_OWNER_NAME,
                name,
            )))
            .await
            .unwrap();
        assert!(remaining.items.is_empty());
    }
}
