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
use crate::crd::pipeline::{validate_pipeline, Pipeline, PipelineStatus, StepSpec};
use crate::error::{Error, Result};
use crate::finalizer;
use crate::fleet::{BundleTarget, HelmOptions};
use crate::merge::render_values;
use crate::resolver::{group_by_workspace, resolve_arc};
use crate::scheduler::{compute_plan, detect_cycle};
use crate::status::{apply_conditions, check_timeout, gating_statuses, observe_node};
use crate::synthesizer::{BundleSynthesizer, FleetBundleSynthesizer};
use crate::telemetry;

pub const OWNER_KIND: &str = "Pipeline";

const REQUEUE_ACTIVE: Duration = Duration::from_secs(15);
const REQUEUE_SETTLED: Duration = Duration::from_secs(300);

#[instrument(skip(ctx, pipeline), fields(trace_id))]
pub async fn reconcile_pipeline(pipeline: Arc<Pipeline>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.mark_reconciled().await;

    let namespace = pipeline
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(pipeline.name_any()))?;
    let name = pipeline.name_any();

    if pipeline.meta().deletion_timestamp.is_some() {
        return cleanup(ctx, &pipeline, &namespace, &name).await;
    }

    if finalizer::needs_finalizer(pipeline.as_ref()) {
        finalizer::add::<Pipeline>(ctx.client.clone(), &name, &namespace).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    info!(pipeline = %name, namespace = %namespace, "reconciling Pipeline");
    let result = apply(ctx.clone(), &pipeline, &namespace, &name).await;
    match result {
        Ok(action) => Ok(action),
        Err(e) if e.is_permanent() => {
            patch_failed_status(&ctx, &pipeline, &namespace, &name, &e).await?;
            Ok(Action::requeue(REQUEUE_SETTLED))
        }
        Err(e) => Err(e),
    }
}

async fn apply(ctx: Arc<Context>, pipeline: &Pipeline, namespace: &str, name: &str) -> Result<Action> {
    validate_pipeline(&pipeline.spec).map_err(Error::ValidationFailure)?;
    let order = detect_cycle(&pipeline.spec.steps)?;
    let clusters = resolve_arc(&ctx.fleet, &pipeline.spec.targets).await?;
    let target_cluster_ids: Vec<String> = clusters.iter().map(|c| c.id.clone()).collect();
    let workspace_groups = group_by_workspace(&clusters);

    let previous = pipeline
        .status
        .as_ref()
        .map(|s| s.deployments.clone())
        .unwrap_or_default();
    let mut retry_counts = pipeline
        .status
        .as_ref()
        .map(|s| s.retry_counts.clone())
        .unwrap_or_default();

    let statuses: BTreeMap<String, DeploymentStatus> = gating_statuses(&previous, &order);
    let plan = compute_plan(&pipeline.spec.steps, &statuses);

    let synthesizer = FleetBundleSynthesizer::new(ctx.fleet.as_ref());
    let mut observations: Vec<DeploymentObservation> = Vec::new();
    let mut hit_timeout: Option<(String, Duration)> = None;

    for step in &pipeline.spec.steps {
        let is_ready = plan.ready.contains(&step.name);
        let is_blocked = plan.blocked.contains(&step.name);
        let already_active = statuses.get(&step.name).copied().unwrap_or(DeploymentStatus::Pending)
            != DeploymentStatus::Pending;

        if is_blocked {
            observations.push(DeploymentObservation {
                chart_name: step.name.clone(),
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
            sync_one_step(
                &ctx,
                &synthesizer,
                namespace,
                name,
                step,
                &workspace_groups,
                pipeline.spec.env,
                pipeline.spec.security.0,
                pipeline.spec.observability.0,
            )
            .await?;
        }

        let mut bundle_deployments = Vec::new();
        for workspace in workspace_groups.keys() {
            let mut found = ctx
                .fleet
                .list_bundle_deployments(workspace.namespace(), &bundle_name(name, &step.name))
                .await
                .unwrap_or_default();
            bundle_deployments.append(&mut found);
        }
        let mut node_observations = observe_node(
            &step.name,
            &target_cluster_ids,
            &bundle_deployments,
            &previous,
            Utc::now(),
        );

        // Unlike a Stack chart's `wait` flag, every Pipeline step always gates
        // on its own timeout — `retries` is what decides whether an expired
        // timeout is a transient hiccup the step recovers from, or a
        // terminal failure that blocks dependents.
        if let Ok(timeout) = step.timeout_duration() {
            let timed_out = node_observations.iter().any(|obs| {
                obs.status != DeploymentStatus::Deployed && check_timeout(obs.last_updated, timeout, Utc::now())
            });
            if timed_out {
                let attempts = retry_counts.get(&step.name).copied().unwrap_or(0);
                if attempts < step.retries {
                    retry_counts.insert(step.name.clone(), attempts + 1);
                    warn!(
                        pipeline = %name, step = %step.name, attempt = attempts + 1, retries = step.retries,
                        "step timed out, retrying within budget"
                    );
                    // Resets the timeout clock: drop this step's carried-forward
                    // `first_observed` timestamps so the next tick starts counting fresh.
                    for obs in &mut node_observations {
                        obs.last_updated = Some(Utc::now());
                    }
                } else {
                    let elapsed = node_observations
                        .iter()
                        .find_map(|obs| obs.last_updated)
                        .and_then(|t| Utc::now().signed_duration_since(t).to_std().ok())
                        .unwrap_or(timeout);
                    hit_timeout = Some((step.name.clone(), elapsed));
                }
            } else {
                retry_counts.remove(&step.name);
            }
        }

        observations.extend(node_observations);
    }

    let expected_names: BTreeSet<String> = pipeline.spec.steps.iter().map(|s| s.name.clone()).collect();
    reap_all_workspaces(&synthesizer, namespace, name, &workspace_groups, &expected_names).await?;

    if let Some((step_name, elapsed)) = hit_timeout {
        warn!(pipeline = %name, step = %step_name, ?elapsed, "step timeout expired, retries exhausted");
        return Err(Error::TimeoutExpired { chart: step_name, elapsed });
    }

    if pipeline.spec.security.0 {
        ctx.fleet.ensure_scan_marker(namespace, OWNER_KIND, name).await?;
    }
    if pipeline.spec.observability.0 {
        ctx.fleet
            .ensure_observability_marker(namespace, OWNER_KIND, name)
            .await?;
    }

    let gating = gating_statuses(&observations, &order);
    let phase = crate::status::compute_phase(&gating, order.len());
    let mut conditions = pipeline.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    apply_conditions(
        &mut conditions,
        phase,
        &phase_message(phase),
        None,
        pipeline.spec.security.0,
        pipeline.spec.observability.0,
        pipeline.status.as_ref().and_then(|s| s.security.as_ref()),
        pipeline.status.as_ref().and_then(|s| s.observability.as_ref()),
        Utc::now(),
    );

    let status = PipelineStatus {
        phase,
        message: phase_message(phase),
        deployments: observations,
        conditions,
        target_clusters: target_cluster_ids,
        security: pipeline.status.as_ref().and_then(|s| s.security.clone()),
        observability: pipeline.status.as_ref().and_then(|s| s.observability.clone()),
        retry_counts,
    };
    patch_status(&ctx, namespace, name, status).await?;

    let requeue = if phase == Phase::Deployed { REQUEUE_SETTLED } else { REQUEUE_ACTIVE };
    Ok(Action::requeue(requeue))
}

/// Applies one Bundle per workspace `workspace_groups` spans, each carrying
/// only the targets resolved to that workspace — a Pipeline whose clusters
/// span `fleet-local` and `fleet-default` gets two Bundles for this step,
/// never one that mixes targets across workspaces.
#[allow(clippy::too_many_arguments)]
async fn sync_one_step(
    ctx: &Arc<Context>,
    synthesizer: &FleetBundleSynthesizer<'_>,
    namespace: &str,
    owner_name: &str,
    step: &StepSpec,
    workspace_groups: &BTreeMap<FleetWorkspace, Vec<ResolvedCluster>>,
    env: crate::crd::stack::EnvLabel,
    security: bool,
    observability: bool,
) -> Result<()> {
    let helm = HelmOptions {
        repo: step.repo.clone(),
        chart: step.name.clone(),
        version: step.version.clone(),
        release_name: step.release_name.clone(),
        namespace: step.namespace.clone(),
    };
    let timeout_seconds = step.timeout_duration().ok().map(|d| d.as_secs());

    for (&workspace, clusters) in workspace_groups {
        let mut targets = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let values = render_values(
                ctx.fleet.as_ref(),
                namespace,
                &step.values,
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
                &step.name,
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
/// currently spans — a workspace a step just vacated still needs its stale
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

fn bundle_name(owner_name: &str, step_name: &str) -> String {
    crate::crd::common::BundleKey::new(
        OWNER_KIND,
        owner_name,
        step_name,
        crate::crd::common::FleetWorkspace::FleetDefault,
    )
    .name
}

fn phase_message(phase: Phase) -> String {
    match phase {
        Phase::Pending => "waiting for steps to start deploying".to_string(),
        Phase::Deploying => "steps are deploying".to_string(),
        Phase::Deployed => "all steps deployed".to_string(),
        Phase::Failed => "one or more steps failed".to_string(),
        Phase::Deleted => "pipeline deleted".to_string(),
    }
}

async fn cleanup(ctx: Arc<Context>, pipeline: &Pipeline, namespace: &str, name: &str) -> Result<Action> {
    if pipeline.finalizers().iter().all(|f| f != crate::crd::common::FINALIZER) {
        return Ok(Action::await_change());
    }
    let synthesizer = FleetBundleSynthesizer::new(ctx.fleet.as_ref());
    for workspace in [FleetWorkspace::FleetLocal, FleetWorkspace::FleetDefault] {
        synthesizer
            .reap(OWNER_KIND, namespace, name, workspace, &BTreeSet::new())
            .await?;
    }
    finalizer::delete::<Pipeline>(ctx.client.clone(), name, namespace).await?;
    Ok(Action::await_change())
}

async fn patch_status(ctx: &Arc<Context>, namespace: &str, name: &str, status: PipelineStatus) -> Result<()> {
    let api: Api<Pipeline> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply("herd-operator").force(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn patch_failed_status(
    ctx: &Arc<Context>,
    pipeline: &Pipeline,
    namespace: &str,
    name: &str,
    e: &Error,
) -> Result<()> {
    let mut conditions = pipeline.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    apply_conditions(
        &mut conditions,
        Phase::Failed,
        &e.to_string(),
        Some(e.reason()),
        pipeline.spec.security.0,
        pipeline.spec.observability.0,
        None,
        None,
        Utc::now(),
    );
    let status = PipelineStatus {
        phase: Phase::Failed,
        message: e.to_string(),
        deployments: pipeline.status.as_ref().map(|s| s.deployments.clone()).unwrap_or_default(),
        conditions,
        target_clusters: pipeline.status.as_ref().map(|s| s.target_clusters.clone()).unwrap_or_default(),
        security: pipeline.status.as_ref().and_then(|s| s.security.clone()),
        observability: pipeline.status.as_ref().and_then(|s| s.observability.clone()),
        retry_counts: pipeline.status.as_ref().map(|s| s.retry_counts.clone()).unwrap_or_default(),
    };
    patch_status(ctx, namespace, name, status).await
}

pub fn error_policy(pipeline: Arc<Pipeline>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(pipeline = %pipeline.name_any(), %error, "reconcile failed");
    ctx.metrics.reconcile.set_failure(&pipeline, error);
    Action::requeue(Duration::from_secs(5 * 60))
}
