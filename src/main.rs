//! casgate daemon
//!
//! Composition root for the gateway: loads configuration, connects the CAS
//! backend (unix socket preferred, HTTP loopback fallback), builds the
//! tiered cache stack, and runs the maintenance loop alongside small
//! health and metrics exposition servers until shutdown.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use anyhow::Context;
use casgate::{
    backend::DaemonTransport, BackendRef, ContentGateway, DaemonBackend, Error, GatewayConfig,
    MockBackend, SystemClock,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// casgate - client-side gateway to content-addressed storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, env = "CASGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Only use public gateways, never the local daemon
    #[arg(long, env = "GATEWAY_ONLY")]
    gateway_only: bool,

    /// Run without any CAS backend (in-memory standalone mode)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

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

    info!("Starting casgate gateway");
    info!("  Version: {}", casgate::VERSION);

    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if args.gateway_only {
        config.fetch.gateway_only = true;
    }

    // Connect the backend: daemon when reachable, in-memory when standalone
    let (backend, connection) = if args.standalone {
        info!("Standalone mode: using in-memory backend");
        (
            Some(Arc::new(MockBackend::new()) as BackendRef),
            casgate::ConnectionKind::Http,
        )
    } else {
        match DaemonBackend::connect(&config.fetch).await {
            Ok(daemon) => {
                let connection = match daemon.transport() {
                    DaemonTransport::UnixSocket(_) => casgate::ConnectionKind::UnixSocket,
                    DaemonTransport::Http(_) => casgate::ConnectionKind::Http,
                };
                info!("  Daemon transport: {}", daemon.transport());
                (Some(Arc::new(daemon) as BackendRef), connection)
            }
            Err(e) => {
                warn!(error = %e, "no CAS backend reachable, running gateway-only");
                config.fetch.gateway_only = true;
                (None, casgate::ConnectionKind::Gateway)
            }
        }
    };

    let clock = Arc::new(SystemClock::new());
    let gateway = ContentGateway::new(config, backend, connection, clock).await?;
    info!("Gateway initialized");

    // Background maintenance
    let maintenance = gateway.maintenance_loop();
    let shutdown = maintenance.shutdown_token();
    let maintenance_handle = maintenance.spawn();

    // Health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_gateway = gateway.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_gateway).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing the shutdown signal handler")?;
    info!("Shutdown requested");

    shutdown.cancel();
    let _ = maintenance_handle.await;

    info!("Gateway shutdown complete");
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

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=info".parse().unwrap());

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
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> casgate::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("invalid health server address: {e}")))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("health server error: {e}")))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, gateway: Arc<ContentGateway>) -> casgate::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let entries = prometheus::register_int_gauge!(
        "casgate_cache_entries",
        "CIDs known to the metadata index"
    )
    .map_err(|e| Error::Internal(e.to_string()))?;
    let hit_rate = prometheus::register_gauge!(
        "casgate_cache_hit_rate",
        "Overall cache hit rate"
    )
    .map_err(|e| Error::Internal(e.to_string()))?;
    let bytes_served = prometheus::register_int_gauge!(
        "casgate_bytes_served_total",
        "Bytes returned to callers"
    )
    .map_err(|e| Error::Internal(e.to_string()))?;
    let bytes_ingested = prometheus::register_int_gauge!(
        "casgate_bytes_ingested_total",
        "Bytes accepted from callers and external sources"
    )
    .map_err(|e| Error::Internal(e.to_string()))?;
    let tier_used = prometheus::register_int_gauge_vec!(
        "casgate_tier_used_bytes",
        "Bytes held per tier",
        &["tier"]
    )
    .map_err(|e| Error::Internal(e.to_string()))?;

    let make_svc = make_service_fn(move |_conn| {
        let gateway = gateway.clone();
        let entries = entries.clone();
        let hit_rate = hit_rate.clone();
        let bytes_served = bytes_served.clone();
        let bytes_ingested = bytes_ingested.clone();
        let tier_used = tier_used.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let gateway = gateway.clone();
                let entries = entries.clone();
                let hit_rate = hit_rate.clone();
                let bytes_served = bytes_served.clone();
                let bytes_ingested = bytes_ingested.clone();
                let tier_used = tier_used.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let stats = gateway.stats();
                            entries.set(stats.entry_count as i64);
                            hit_rate.set(stats.metrics.overall_hit_rate);
                            bytes_served.set(stats.metrics.bytes_served as i64);
                            bytes_ingested.set(stats.metrics.bytes_ingested as i64);
                            for tier in &stats.tiers {
                                tier_used
                                    .with_label_values(&[tier.name.as_str()])
                                    .set(tier.used_bytes as i64);
                            }

                            let encoder = TextEncoder::new();
                            let metric_families = prometheus::gather();
                            let mut buffer = Vec::new();
                            encoder.encode(&metric_families, &mut buffer).unwrap();

                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap()
                        }
                        "/report" => Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Type", "text/plain; charset=utf-8")
                            .body(Body::from(gateway.report()))
                            .unwrap(),
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found"))
                            .unwrap(),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("invalid metrics server address: {e}")))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("metrics server error: {e}")))?;

    Ok(())
}
