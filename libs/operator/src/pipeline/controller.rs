use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::{self, ReflectHandle};
use kube::runtime::{watcher, WatchStreamExt};
use tracing::{debug, error, info, trace};

use crate::controller::{ControllerId, State};
use crate::crd::pipeline::Pipeline;
use crate::fleet::{BundleDeployment, FleetClient};
use crate::pipeline::reconcile::{error_policy, reconcile_pipeline};

pub const CONTROLLER_ID: ControllerId = "pipeline";

const SUBSCRIBE_BUFFER_SIZE: usize = 256;
const RELOAD_BUFFER_SIZE: usize = 16;

/// Initializes the Pipeline controller and runs its reconcile loop to
/// completion (i.e. until shutdown). Reconciliation is level-triggered both on
/// a Pipeline's own spec changes and on an observed status change on a child
/// BundleDeployment, via a shared reflector the same way the teacher reloads
/// on owned `Deployment` events.
pub async fn run(state: State, client: Client, fleet: Arc<dyn FleetClient>, worker_count: u16) {
    let pipelines = Api::<Pipeline>::all(client.clone());
    if let Err(e) = pipelines.list(&ListParams::default().limit(1)).await {
        error!("Pipeline CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let (_bundle_deployment_store, writer) = reflector::store_shared(SUBSCRIBE_BUFFER_SIZE);
    let subscriber: ReflectHandle<BundleDeployment> = writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");

    let (reload_tx, reload_rx) = futures::channel::mpsc::channel(RELOAD_BUFFER_SIZE);

    let bundle_deployments = Api::<BundleDeployment>::all(client.clone());
    let bundle_deployment_watch = watcher(bundle_deployments, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect_shared(writer)
        .for_each(|res| {
            let mut reload_tx = reload_tx.clone();
            async move {
                match res {
                    Ok(event) => {
                        debug!(?event, "watched BundleDeployment event");
                        let _ignore_full_buffer = reload_tx
                            .try_send(())
                            .map_err(|e| error!(msg = "failed to trigger reconcile on BundleDeployment event", %e));
                    }
                    Err(e) => error!(msg = "unexpected error watching BundleDeployment", %e),
                }
            }
        });

    trace!("init pipeline controller");
    let ctx = state.to_context(client, fleet);
    let pipeline_controller = Controller::new(pipelines, watcher::Config::default().any_semantic())
        .owns_shared_stream(subscriber)
        .reconcile_all_on(reload_rx.map(|_| ()))
        .with_config(controller::Config::default().concurrency(worker_count.into()))
        .shutdown_on_signal()
        .run(reconcile_pipeline, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    tokio::select! {
        _ = pipeline_controller => {},
        _ = bundle_deployment_watch => {}
    }
    info!("pipeline controller stopped");
}
