//! Rigwatch
//!
//! Fleet monitor for network-attached mining devices.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Rigwatch                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Discovery   │───▶│   Registry   │───▶│   Polling    │       │
//! │  │    loop      │    │              │    │    loop      │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          │                                       │               │
//! │          └───────────── Device Client ───────────┘               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rigwatch::adapters::{
    CompositeTelemetrySink, InMemoryFleetStore, JsonlTelemetrySink, LoggingEventPublisher,
};
use rigwatch::config::{format_duration, RangeSpec};
use rigwatch::discovery::enumerate_candidates;
use rigwatch::domain::ports::{DeviceApi, TelemetrySink};
use rigwatch::error::{Error, Result};
use rigwatch::{
    normalize, DeviceClient, DiscoveryEngine, Fleet, FleetConfig, FleetMetrics, FleetPorts,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Rigwatch - Discovery and telemetry polling for mining device fleets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, global = true, env = "RIGWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Device API port (overrides the configuration file)
    #[arg(long, global = true, env = "RIGWATCH_PORT")]
    port: Option<u16>,

    /// Address range to sweep, as `start-end` or CIDR; repeatable
    /// (replaces the configured ranges)
    #[arg(long = "range", global = true, value_name = "RANGE")]
    ranges: Vec<String>,

    /// Append every telemetry record to this JSON-lines file
    #[arg(long, global = true, env = "RIGWATCH_TELEMETRY_LOG")]
    telemetry_log: Option<PathBuf>,

    /// Metrics server bind address
    #[arg(long, global = true, env = "METRICS_ADDR", default_value = "0.0.0.0:9100")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, global = true, env = "HEALTH_ADDR", default_value = "0.0.0.0:9101")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Run the discovery and polling loops until interrupted (default)
    Run,
    /// Run one discovery pass and print the confirmed addresses
    Discover,
    /// Fetch and normalize one device's telemetry
    Probe {
        /// Device address
        address: Ipv4Addr,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = load_config(&args)?;

    match args.command.clone().unwrap_or(Cmd::Run) {
        Cmd::Run => run(&args, config).await,
        Cmd::Discover => discover(config).await,
        Cmd::Probe { address } => probe(config, address).await,
    }
}

fn load_config(args: &Args) -> Result<FleetConfig> {
    let mut config = match &args.config {
        Some(path) => FleetConfig::load(path)?,
        None => FleetConfig::default(),
    };

    if let Some(port) = args.port {
        config.api_port = port;
    }
    if !args.ranges.is_empty() {
        config.ranges = args
            .ranges
            .iter()
            .map(|r| RangeSpec::Notation(r.clone()))
            .collect();
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: &Args, config: FleetConfig) -> Result<()> {
    info!("Starting Rigwatch");
    info!("  Device API port: {}", config.api_port);
    info!("  Ranges: {}", config.resolve_ranges()?.len());
    info!(
        "  Discovery every {}, polling every {}",
        format_duration(config.discovery_interval),
        format_duration(config.poll_interval)
    );
    info!(
        "  Batch size: {}, max concurrent polls: {}",
        config.batch_size, config.max_concurrent_polls
    );

    let metrics = FleetMetrics::new()?;
    let client = Arc::new(DeviceClient::new(config.client())?);
    let store = Arc::new(InMemoryFleetStore::new(config.history_limit));

    let sink: Arc<dyn TelemetrySink> = match &args.telemetry_log {
        Some(path) => {
            let jsonl = JsonlTelemetrySink::open(path).await?;
            info!("  Telemetry log: {}", path.display());
            Arc::new(
                CompositeTelemetrySink::new()
                    .with_sink(store.clone())
                    .with_sink(Arc::new(jsonl)),
            )
        }
        None => store.clone(),
    };

    let fleet = Fleet::new(
        &config,
        FleetPorts {
            api: client,
            registry: store.clone(),
            sink,
            events: Arc::new(LoggingEventPublisher::info_level()),
        },
    )?
    .with_metrics(metrics.clone());

    // Start health server
    let ready = Arc::new(AtomicBool::new(false));
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let handle = Arc::new(fleet).spawn(CancellationToken::new());
    ready.store(true, Ordering::SeqCst);

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping");
    ready.store(false, Ordering::SeqCst);
    handle.shutdown().await;

    let stats = store.fleet_stats();
    info!(
        "Rigwatch shutdown complete ({} devices, {} online, {:.2} TH/s, {:.0} W)",
        stats.total_devices, stats.online, stats.total_hashrate, stats.total_power_watts
    );
    Ok(())
}

async fn discover(config: FleetConfig) -> Result<()> {
    let client = Arc::new(DeviceClient::new(config.client())?);
    let engine = DiscoveryEngine::new(client, config.discovery());
    let candidates = enumerate_candidates(&config.resolve_ranges()?);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let report = engine.discover(&candidates, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn probe(config: FleetConfig, address: Ipv4Addr) -> Result<()> {
    let client = DeviceClient::new(config.client())?;
    let raw = client.fetch_all(address).await.ok_or_else(|| {
        Error::Internal(format!(
            "{} did not answer any command on port {}",
            address, config.api_port
        ))
    })?;

    println!("{}", serde_json::to_string_pretty(&normalize(&raw))?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let directive = |d: &str| {
        d.parse::<Directive>()
            .map_err(|e| Error::Config(format!("invalid log directive {}: {}", d, e)))
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("reqwest=warn")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(
    status: hyper::StatusCode,
    body: impl Into<hyper::body::Bytes>,
) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    let mut response = hyper::Response::new(http_body_util::Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let ready = ready.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: FleetMetrics) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let body = match req.uri().path() {
                    "/metrics" => Some(metrics.encode()),
                    _ => None,
                };
                async move {
                    let response = match body {
                        Some(Ok(text)) => {
                            let mut response = text_response(StatusCode::OK, text);
                            response.headers_mut().insert(
                                hyper::header::CONTENT_TYPE,
                                hyper::header::HeaderValue::from_static(
                                    "text/plain; version=0.0.4",
                                ),
                            );
                            response
                        }
                        Some(Err(e)) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                        None => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
