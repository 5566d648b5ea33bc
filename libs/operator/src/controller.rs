use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::client::Client;
use kube::runtime::events::Reporter;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::fleet::FleetClient;
use crate::metrics::Metrics;

/// Identifies which controller (`"stack"`/`"pipeline"`) a `Context`/`State`
/// instance belongs to — used in `Diagnostics::reporter` and the `/healthz`
/// per-controller readiness check.
pub type ControllerId = &'static str;

/// Context injected with each `reconcile`/`error_policy` invocation. Shared
/// by both the Stack and Pipeline controllers — neither the Kubernetes
/// client nor the Fleet façade are specific to either kind.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub fleet: Arc<dyn FleetClient>,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Arc<Metrics>,
    last_reconcile: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl Context {
    /// Records that a reconcile pass just completed — called from both the
    /// success and error paths so `/healthz` reflects liveness of the
    /// reconcile loop itself, not just its success rate.
    pub async fn mark_reconciled(&self) {
        *self.last_reconcile.write().await = Some(Utc::now());
        self.diagnostics.write().await.last_event = Utc::now();
    }
}

/// Diagnostics read by the web server.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    fn new(controller_id: ControllerId) -> Self {
        Self {
            last_event: Utc::now(),
            reporter: format!("herd-{controller_id}-controller").into(),
        }
    }
}

/// State shared between one controller's reconcile loop and the web server.
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
    last_reconcile: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl State {
    /// `registry` is the process-wide metrics registry; this controller's
    /// reconcile metrics are registered into it under a `controller_id` prefix.
    pub fn new(controller_id: ControllerId, registry: &mut Registry) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(controller_id))),
            metrics: Arc::new(Metrics::new(registry, controller_id)),
            last_reconcile: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// `true` once a reconcile has completed within `max_age` of now — the
    /// readiness condition `/healthz` reports on
    /// (`2 * RESYNC_INTERVAL` by convention, passed in by the caller).
    pub async fn is_fresh(&self, max_age: chrono::Duration) -> bool {
        match *self.last_reconcile.read().await {
            Some(last) => Utc::now().signed_duration_since(last) <= max_age,
            None => false,
        }
    }

    pub fn to_context(&self, client: Client, fleet: Arc<dyn FleetClient>) -> Arc<Context> {
        Arc::new(Context {
            client,
            fleet,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            last_reconcile: self.last_reconcile.clone(),
        })
    }
}
