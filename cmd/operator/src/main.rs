use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use herd_k8s_util::client::new_client_with_metrics;
use herd_operator::controller::State;
use herd_operator::fleet::{FleetClient, KubeFleetClient};
use herd_operator::telemetry;
use herd_operator::{pipeline, stack};

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Shared state for the web server: the stack/pipeline controller states
/// (diagnostics + readiness) plus the process-wide metrics registry they and
/// the HTTP client metrics layer are all registered into.
#[derive(Clone)]
struct AppState {
    stack: State,
    pipeline: State,
    registry: Arc<Registry>,
    resync_interval: chrono::Duration,
}

#[get("/metrics")]
async fn metrics(c: Data<AppState>, _req: HttpRequest) -> impl Responder {
    let mut buffer = String::new();
    match prometheus_client::encoding::text::encode(&mut buffer, &c.registry) {
        Ok(()) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

/// Liveness: the process is up and serving requests.
#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

/// Readiness: both controllers have completed a reconcile within
/// `2 * resync_interval` of now.
#[get("/healthz")]
async fn healthz(c: Data<AppState>, _req: HttpRequest) -> impl Responder {
    let max_age = c.resync_interval * 2;
    let stack_fresh = c.stack.is_fresh(max_age).await;
    let pipeline_fresh = c.pipeline.is_fresh(max_age).await;
    if stack_fresh && pipeline_fresh {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("not ready")
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "herd-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,herd_operator=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Expected interval between two reconciles of the same resource absent
    /// any spec change. `/healthz` reports not-ready once a controller falls
    /// more than twice this far behind.
    #[arg(long, default_value = "10m", env)]
    resync_interval: String,

    /// Number of reconciles each controller runs concurrently.
    #[arg(long, default_value_t = 4, env = "WORKER_COUNT")]
    worker_count: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let resync_interval = chrono::Duration::from_std(humantime::parse_duration(&args.resync_interval)?)?;

    let mut registry = Registry::with_prefix("herd");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;
    let fleet: Arc<dyn FleetClient> = Arc::new(KubeFleetClient::new(client.clone()));

    let stack_state = State::new(stack::controller::CONTROLLER_ID, &mut registry);
    let pipeline_state = State::new(pipeline::controller::CONTROLLER_ID, &mut registry);

    let app_state = AppState {
        stack: stack_state.clone(),
        pipeline: pipeline_state.clone(),
        registry: Arc::new(registry),
        resync_interval,
    };

    let stack_controller =
        stack::controller::run(stack_state, client.clone(), fleet.clone(), args.worker_count);
    let pipeline_controller =
        pipeline::controller::run(pipeline_state, client, fleet, args.worker_count);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(app_state.clone()))
            .wrap(middleware::Logger::default().exclude("/health").exclude("/healthz"))
            .service(health)
            .service(healthz)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    // All runtimes implement graceful shutdown, so poll until every one is done.
    tokio::try_join!(
        async {
            tokio::join!(stack_controller, pipeline_controller);
            Ok::<(), std::io::Error>(())
        },
        server.run(),
    )?;
    Ok(())
}
