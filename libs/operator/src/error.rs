/// Errors possible during reconciliation. Each variant carries enough context
/// to build `status.message` and the corresponding Kubernetes event without
/// ever interpolating Secret payloads.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// Invalid resource definition caught by admission-time validation
    /// (empty `charts`/`steps`, both/neither `targets` forms set, unknown
    /// `step.type`). Permanent; phase `Failed`.
    #[error("invalid resource definition: {0}")]
    ValidationFailure(String),

    /// `dependsOn` forms a cycle. Permanent; phase `Failed`, reason `CycleDetected`.
    #[error("dependency cycle detected among: {0:?}")]
    CycleDetected(Vec<String>),

    /// A `clusterIds` target resolved to zero valid clusters, or a `selector`
    /// matched nothing.
    #[error("no targets resolved: {0}")]
    NoTargets(String),

    /// Transient failure listing clusters from the Rancher/Fleet client; retried
    /// with exponential backoff.
    #[error("transient cluster list failure: {0}")]
    TransientClusterListFailure(String),

    /// A named ConfigMap/Secret value source was absent. Permanent for the
    /// affected chart; the chart's deployments are marked `Failed`, its
    /// dependents `Blocked`.
    #[error("missing value source {kind} {namespace}/{name}")]
    MissingValueSource {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// A ConfigMap/Secret payload failed to parse as YAML. Permanent for the
    /// affected chart, same disposition as `MissingValueSource`.
    #[error("failed to parse values payload from {kind} {namespace}/{name}: {message}")]
    ParseFailure {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },

    /// The Fleet API reported a conflict applying a Bundle; retried once after
    /// refetch, then surfaced as `Failed`.
    #[error("bundle apply conflict for {0}")]
    BundleApplyConflict(String),

    /// A chart's `wait` timeout expired before its BundleDeployments reached `Ready`.
    #[error("timeout expired waiting for chart {chart} after {elapsed:?}")]
    TimeoutExpired {
        chart: String,
        elapsed: std::time::Duration,
    },

    /// The parent resource is being deleted; reaping is in progress.
    #[error("deletion in progress: {0}")]
    DeletionInProgress(String),

    /// Resource is missing a namespace, which `herd.suse.com/v1` kinds always require.
    #[error("resource {0} must be namespaced")]
    MissingNamespace(String),

    /// A duration field (`timeout`) failed to parse.
    #[error("invalid duration {value:?}: {source}")]
    InvalidDuration {
        value: String,
        source: humantime::DurationError,
    },

    /// The current tracing span carries no valid OpenTelemetry trace id
    /// (tracing not initialized, or span outside the reconcile instrumentation).
    #[error("no valid trace id in current span")]
    InvalidTraceId,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A cardinality-safe label for Prometheus failure counters — never
    /// includes resource names, Secret contents, or other high-cardinality or
    /// sensitive data.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError { .. } => "kube_error".to_string(),
            Error::ValidationFailure(_) => "validation_failure".to_string(),
            Error::CycleDetected(_) => "cycle_detected".to_string(),
            Error::NoTargets(_) => "no_targets".to_string(),
            Error::TransientClusterListFailure(_) => "transient_cluster_list_failure".to_string(),
            Error::MissingValueSource { .. } => "missing_value_source".to_string(),
            Error::ParseFailure { .. } => "parse_failure".to_string(),
            Error::BundleApplyConflict(_) => "bundle_apply_conflict".to_string(),
            Error::TimeoutExpired { .. } => "timeout_expired".to_string(),
            Error::DeletionInProgress(_) => "deletion_in_progress".to_string(),
            Error::MissingNamespace(_) => "missing_namespace".to_string(),
            Error::InvalidDuration { .. } => "invalid_duration".to_string(),
            Error::InvalidTraceId => "invalid_trace_id".to_string(),
        }
    }

    /// Whether this error is permanent for the current reconciliation (no
    /// amount of retrying will resolve it without a change to the resource).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::ValidationFailure(_)
                | Error::CycleDetected(_)
                | Error::NoTargets(_)
                | Error::MissingValueSource { .. }
                | Error::ParseFailure { .. }
                | Error::TimeoutExpired { .. }
        )
    }

    /// CamelCase `Ready` condition reason for a permanent failure, distinct
    /// per error kind so a cycle reads `CycleDetected` rather than a generic
    /// `Failed`.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError { .. } => "KubeError",
            Error::ValidationFailure(_) => "ValidationFailure",
            Error::CycleDetected(_) => "CycleDetected",
            Error::NoTargets(_) => "NoTargets",
            Error::TransientClusterListFailure(_) => "TransientClusterListFailure",
            Error::MissingValueSource { .. } => "MissingValueSource",
            Error::ParseFailure { .. } => "ParseFailure",
            Error::BundleApplyConflict(_) => "BundleApplyConflict",
            Error::TimeoutExpired { .. } => "TimeoutExpired",
            Error::DeletionInProgress(_) => "DeletionInProgress",
            Error::MissingNamespace(_) => "MissingNamespace",
            Error::InvalidDuration { .. } => "InvalidDuration",
            Error::InvalidTraceId => "InvalidTraceId",
        }
    }
}
