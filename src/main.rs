//! Catalog Sync
//!
//! Runs one synchronization job from a JSON catalog fixture into an
//! in-memory destination. Durable state (cache cold tier, digest index and
//! checkpoints) is journaled next to a snapshot file as it is written, so
//! `--resume` continues an interrupted or killed run in a later invocation.
//!
//! ```text
//! catalog.json ──▶ BatchProcessor ──▶ MemoryDestination
//!                        │
//!          state snapshot + journal (--state)
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use catalog_sync::clock::SystemClock;
use catalog_sync::sync::{BatchProcessor, FixtureOrigin, JobState, MemoryDestination};
use catalog_sync::{JournaledStore, SyncConfig, SyncMetrics};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Catalog Sync - resumable catalog synchronizer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (defaults apply when omitted)
    #[arg(long, env = "CATALOG_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// JSON catalog served as the origin
    #[arg(long, env = "CATALOG_SYNC_FIXTURE")]
    fixture: PathBuf,

    /// Snapshot file holding durable state between runs; writes are
    /// journaled to `<state>.journal` until the run ends
    #[arg(long, env = "CATALOG_SYNC_STATE", default_value = "catalog-sync-state.json")]
    state: PathBuf,

    /// Job identity (one running job per identity)
    #[arg(long, env = "CATALOG_SYNC_JOB_ID", default_value = "catalog")]
    job_id: String,

    /// Continue after the saved checkpoint instead of starting over
    #[arg(long, env = "CATALOG_SYNC_RESUME")]
    resume: bool,

    /// Serve /metrics, /status and /healthz on this address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(
        job_id = %args.job_id,
        fixture = %args.fixture.display(),
        resume = args.resume,
        "Starting Catalog Sync v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match &args.config {
        Some(path) => SyncConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let store = Arc::new(
        JournaledStore::open(&args.state, Arc::new(SystemClock))
            .with_context(|| format!("opening state {}", args.state.display()))?,
    );
    info!(
        path = %args.state.display(),
        keys = store.stats().key_count,
        journaled = store.pending_entries(),
        "State opened"
    );

    let origin = FixtureOrigin::from_json_file(&args.fixture)
        .with_context(|| format!("loading catalog fixture {}", args.fixture.display()))?;
    info!(items = origin.len(), "Catalog fixture loaded");

    let destination = Arc::new(MemoryDestination::new());
    let metrics = SyncMetrics::new()?;
    let processor = Arc::new(
        BatchProcessor::new(
            &args.job_id,
            config,
            store.clone(),
            Arc::new(origin),
            destination.clone(),
        )
        .context("invalid configuration")?
        .with_metrics(metrics.clone()),
    );

    if let Some(addr) = args.metrics_addr.clone() {
        let processor = processor.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(&addr, metrics, processor).await {
                error!("HTTP server error: {:#}", e);
            }
        });
    }

    tokio::spawn({
        let processor = processor.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping after the current item");
                processor.cancel();
            }
        }
    });

    let report = processor.run(args.resume).await?;

    store
        .compact()
        .with_context(|| format!("compacting state {}", args.state.display()))?;
    info!(
        path = %args.state.display(),
        items_written = destination.item_count(),
        assets_written = destination.asset_count(),
        "State compacted"
    );

    println!("{}", report.to_json_pretty()?);

    if report.state == JobState::Failed {
        bail!(
            "job {} failed: {}",
            report.job_id,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn", level)));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// HTTP Server
// =============================================================================

async fn run_http_server(
    addr: &str,
    metrics: SyncMetrics,
    processor: Arc<BatchProcessor>,
) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    fn route(
        req: &Request<hyper::body::Incoming>,
        metrics: &SyncMetrics,
        processor: &BatchProcessor,
    ) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => {
                respond(StatusCode::OK, "text/plain", b"ok".to_vec())
            }
            "/metrics" => match metrics.encode() {
                Ok(text) => respond(
                    StatusCode::OK,
                    "text/plain; version=0.0.4",
                    text.into_bytes(),
                ),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string().into_bytes(),
                ),
            },
            "/status" => match serde_json::to_vec(&processor.status()) {
                Ok(json) => respond(StatusCode::OK, "application/json", json),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string().into_bytes(),
                ),
            },
            _ => respond(StatusCode::NOT_FOUND, "text/plain", b"not found".to_vec()),
        }
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid HTTP server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", addr))?;

    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("HTTP server accept error")?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        let processor = processor.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = route(&req, &metrics, &processor);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("HTTP server connection error: {}", e);
            }
        });
    }
}
