use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{field, info, instrument, warn, Span};

use crate::controller::Context;
use crate::crd::common::{DeploymentObservation, DeploymentStatus, FleetWorkspace, Phase, ResolvedCluster};
use crate::crd::stack::{validate_stack, ChartSpec, Stack, StackStatus};
use crate::error::{Error, Result};
use crate::finalizer;
use crate::fleet::{BundleTarget, HelmOptions};
use crate::merge::render_values;
use crate::resolver::{group_by_workspace, resolve_arc};
use crate::scheduler::{compute_plan, detect_cycle};
use crate::status::{apply_conditions, check_timeout, gating_statuses, observe_node};
use crate::synthesizer::{BundleSynthesizer, FleetBundleSynthesizer};
use crate::telemetry;

pub const OWNER_KIND: &str = "Stack";

const REQUEUE_ACTIVE: Duration = Duration::from_secs(15);
const REQUEUE_SETTLED: Duration = Duration::from_secs(300);

#[instrument(skip(ctx, stack), fields(trace_id))]
pub async fn reconcile_stack(stack: Arc<Stack>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.mark_reconciled().await;

    let namespace = stack
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(stack.name_any()))?;
    let name = stack.name_any();

    if stack.meta().deletion_timestamp.is_some() {
        return cleanup(ctx, &stack, &namespace, &name).await;
    }

    if finalizer::needs_finalizer(stack.as_ref()) {
        finalizer::add::<Stack>(ctx.client.clone(), &name, &namespace).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    info!(stack = %name, namespace = %namespace, "reconciling Stack");
    let result = apply(ctx.clone(), &stack, &namespace, &name).await;
    match result {
        Ok(action) => Ok(action),
        Err(e) if e.is_permanent() => {
            patch_failed_status(&ctx, &stack, &namespace, &name, &e).await?;
            Ok(Action::requeue(REQUEUE_SETTLED))
        }
        Err(e) => Err(e),
    }
}

async fn apply(ctx: Arc<Context>, stack: &Stack, namespace: &str, name: &str) -> Result<Action> {
    validate_stack(&stack.spec).map_err(Error::ValidationFailure)?;
    let order = detect_cycle(&stack.spec.charts)?;
    let clusters = resolve_arc(&ctx.fleet, &stack.spec.targets).await?;
    let target_cluster_ids: Vec<String> = clusters.iter().map(|c| c.id.clone()).collect();
    let workspace_groups = group_by_workspace(&clusters);

    let previous = stack
        .status
        .as_ref()
        .map(|s| s.deployments.clone())
        .unwrap_or_default();

    let statuses: BTreeMap<String, DeploymentStatus> = gating_statuses(&previous, &order);
    let plan = compute_plan(&stack.spec.charts, &statuses);

    let synthesizer = FleetBundleSynthesizer::new(ctx.fleet.as_ref());
    let mut observations: Vec<DeploymentObservation> = Vec::new();
    let mut hit_timeout: Option<(String, Duration)> = None;

    for chart in &stack.spec.charts {
        let is_ready = plan.ready.contains(&chart.name);
        let is_blocked = plan.blocked.contains(&chart.name);
        let already_active = statuses.get(&chart.name).copied().unwrap_or(DeploymentStatus::Pending)
            != DeploymentStatus::Pending;

        if is_blocked {
            observations.push(DeploymentObservation {
                chart_name: chart.name.clone(),
                cluster_id: String::new(),
                status: DeploymentStatus::Blocked,
                last_updated: Some(Utc::now()),
                message: Some("a dependency failed or is blocked".to_string()),
            });
            continue;
        }

        if !is_ready && !already_active {
            continue;
        }

        if is_ready {
            sync_one_chart(
                &ctx,
                &synthesizer,
                namespace,
                name,
                chart,
                &workspace_groups,
                stack.spec.env,
                stack.spec.security.0,
                stack.spec.observability.0,
            )
            .await?;
        }

        let mut bundle_deployments = Vec::new();
        for workspace in workspace_groups.keys() {
            let mut found = ctx
                .fleet
                .list_bundle_deployments(workspace.namespace(), &bundle_name(name, &chart.name))
                .await
                .unwrap_or_default();
            bundle_deployments.append(&mut found);
        }
        let node_observations = observe_node(
            &chart.name,
            &target_cluster_ids,
            &bundle_deployments,
            &previous,
            Utc::now(),
        );

        // The timer always runs; `wait` only decides whether an expired
        // timeout fails the Stack outright instead of just being reported
        // via the per-node observation.
        if chart.wait {
            if let Ok(timeout) = chart.timeout_duration() {
                for obs in &node_observations {
                    if obs.status != DeploymentStatus::Deployed
                        && check_timeout(obs.last_updated, timeout, Utc::now())
                    {
                        let elapsed = obs
                            .last_updated
                            .and_then(|t| Utc::now().signed_duration_since(t).to_std().ok())
                            .unwrap_or(timeout);
                        hit_timeout = Some((chart.name.clone(), elapsed));
                    }
                }
            }
        }

        observations.extend(node_observations);
    }

    let expected_names: BTreeSet<String> = stack.spec.charts.iter().map(|c| c.name.clone()).collect();
    reap_all_workspaces(&synthesizer, namespace, name, &workspace_groups, &expected_names).await?;

    if let Some((chart_name, elapsed)) = hit_timeout {
        warn!(stack = %name, chart = %chart_name, ?elapsed, "chart wait timeout expired");
        return Err(Error::TimeoutExpired { chart: chart_name, elapsed });
    }

    if stack.spec.security.0 {
        ctx.fleet.ensure_scan_marker(namespace, OWNER_KIND, name).await?;
    }
    if stack.spec.observability.0 {
        ctx.fleet
            .ensure_observability_marker(namespace, OWNER_KIND, name)
            .await?;
    }

    let gating = gating_statuses(&observations, &order);
    let phase = crate::status::compute_phase(&gating, order.len());
    let mut conditions = stack.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    apply_conditions(
        &mut conditions,
        phase,
        &phase_message(phase),
        None,
        stack.spec.security.0,
        stack.spec.observability.0,
        stack.status.as_ref().and_then(|s| s.security.as_ref()),
        stack.status.as_ref().and_then(|s| s.observability.as_ref()),
        Utc::now(),
    );

    let status = StackStatus {
        phase,
        message: phase_message(phase),
        deployments: observations,
        conditions,
        target_clusters: target_cluster_ids,
        security: stack.status.as_ref().and_then(|s| s.security.clone()),
        observability: stack.status.as_ref().and_then(|s| s.observability.clone()),
    };
    patch_status(&ctx, namespace, name, status).await?;

    let requeue = if phase == Phase::Deployed { REQUEUE_SETTLED } else { REQUEUE_ACTIVE };
    Ok(Action::requeue(requeue))
}

/// Applies one Bundle per workspace `workspace_groups` spans, each carrying
/// only the targets resolved to that workspace — a Stack whose clusters span
/// `fleet-local` and `fleet-default` gets two Bundles for this chart, never one
/// that mixes targets across workspaces.
#[allow(clippy::too_many_arguments)]
async fn sync_one_chart(
    ctx: &Arc<Context>,
    synthesizer: &FleetBundleSynthesizer<'_>,
    namespace: &str,
    owner_name: &str,
    chart: &ChartSpec,
    workspace_groups: &BTreeMap<FleetWorkspace, Vec<ResolvedCluster>>,
    env: crate::crd::stack::EnvLabel,
    security: bool,
    observability: bool,
) -> Result<()> {
    let helm = HelmOptions {
        repo: chart.repo.clone(),
        chart: chart.name.clone(),
        version: chart.version.clone(),
        release_name: chart.release_name.clone(),
        namespace: chart.namespace.clone(),
    };
    let timeout_seconds = chart.timeout_duration().ok().map(|d| d.as_secs());

    for (&workspace, clusters) in workspace_groups {
        let mut targets = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let values = render_values(
                ctx.fleet.as_ref(),
                namespace,
                &chart.values,
                env,
                cluster,
                security,
                observability,
            )
            .await?;
            targets.push(BundleTarget {
                cluster_id: cluster.id.clone(),
                values,
            });
        }

        synthesizer
            .sync_chart(
                OWNER_KIND,
                namespace,
                owner_name,
                &chart.name,
                workspace,
                helm.clone(),
                targets,
                timeout_seconds,
            )
            .await?;
    }
    Ok(())
}

/// Reaps every fixed Fleet workspace, not just the ones `workspace_groups`
/// currently spans — a workspace a chart just vacated still needs its stale
/// Bundle removed, so its expected set is empty rather than skipped entirely.
async fn reap_all_workspaces(
    synthesizer: &FleetBundleSynthesizer<'_>,
    namespace: &str,
    name: &str,
    workspace_groups: &BTreeMap<FleetWorkspace, Vec<ResolvedCluster>>,
    expected_names: &BTreeSet<String>,
) -> Result<()> {
    for workspace in [FleetWorkspace::FleetLocal, FleetWorkspace::FleetDefault] {
        let expected = if workspace_groups.contains_key(&workspace) {
            expected_names.clone()
        } else {
            BTreeSet::new()
        };
        synthesizer.reap(OWNER_KIND, namespace, name, workspace, &expected).await?;
    }
    Ok(())
}

fn bundle_name(owner_name: &str, chart_name: &str) -> String {
    crate::crd::common::BundleKey::new(
        OWNER_KIND,
        owner_name,
        chart_name,
        crate::crd::common::FleetWorkspace::FleetDefault,
    )
    .name
}

fn phase_message(phase: Phase) -> String {
    match phase {
        Phase::Pending => "waiting for charts to start deploying".to_string(),
        Phase::Deploying => "charts are deploying".to_string(),
        Phase::Deployed => "all charts deployed".to_string(),
        Phase::Failed => "one or more charts failed".to_string(),
        Phase::Deleted => "stack deleted".to_string(),
    }
}

async fn cleanup(ctx: Arc<Context>, stack: &Stack, namespace: &str, name: &str) -> Result<Action> {
    if stack.finalizers().iter().all(|f| f != crate::crd::common::FINALIZER) {
        return Ok(Action::await_change());
    }
    let synthesizer = FleetBundleSynthesizer::new(ctx.fleet.as_ref());
    for workspace in [FleetWorkspace::FleetLocal, FleetWorkspace::FleetDefault] {
        synthesizer
            .reap(OWNER_KIND, namespace, name, workspace, &BTreeSet::new())
            .await?;
    }
    finalizer::delete::<Stack>(ctx.client.clone(), name, namespace).await?;
    Ok(Action::await_change())
}

async fn patch_status(ctx: &Arc<Context>, namespace: &str, name: &str, status: StackStatus) -> Result<()> {
    let api: Api<Stack> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply("herd-operator").force(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn patch_failed_status(ctx: &Arc<Context>, stack: &Stack, namespace: &str, name: &str, e: &Error) -> Result<()> {
    let mut conditions = stack.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    apply_conditions(
        &mut conditions,
        Phase::Failed,
        &e.to_string(),
        Some(e.reason()),
        stack.spec.security.0,
        stack.spec.observability.0,
        None,
        None,
        Utc::now(),
    );
    let status = StackStatus {
        phase: Phase::Failed,
        message: e.to_string(),
        deployments: stack.status.as_ref().map(|s| s.deployments.clone()).unwrap_or_default(),
        conditions,
        target_clusters: stack.status.as_ref().map(|s| s.target_clusters.clone()).unwrap_or_default(),
        security: stack.status.as_ref().and_then(|s| s.security.clone()),
        observability: stack.status.as_ref().and_then(|s| s.observability.clone()),
    };
    patch_status(ctx, namespace, name, status).await
}

pub fn error_policy(stack: Arc<Stack>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(stack = %stack.name_any(), %error, "reconcile failed");
    ctx.metrics.reconcile.set_failure(&stack, error);
    Action::requeue(Duration::from_secs(5 * 60))
}
