//! edgecache host harness
//!
//! Drives the engine lifecycle from the command line and exposes health and
//! Prometheus endpoints while serving.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          edgecache                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  restore ─▶ install ─▶ activate ─▶ command ─▶ shutdown/save  │
//! │                                                              │
//! │  /healthz /readyz (health addr)     /metrics (metrics addr)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edgecache::error::{Error, Result};
use edgecache::{Engine, EngineConfig, EngineStats, JsonFileStorage, RequestDescriptor};

// =============================================================================
// CLI Arguments
// =============================================================================

/// edgecache - multi-tier response cache and offline delivery engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "EDGECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for persisted cache snapshots
    #[arg(long, env = "EDGECACHE_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:9091")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the engine with maintenance, health and metrics until interrupted
    Serve,
    /// Serve one request through the engine and print the outcome
    Fetch {
        url: String,
        /// Treat the request as a top-level page navigation
        #[arg(long)]
        navigate: bool,
    },
    /// Warm the prefetch cache
    Prefetch {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Drop one cache by kind (`audio`) or full name
    Purge { cache: String },
    /// Run one TTL and size sweep over every cache
    Maintain,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    info!("Starting edgecache");
    info!("  Namespace: {}", config.namespace);
    info!("  Version: {}", config.version);
    info!("  Origin: {}", config.origin);
    info!(
        "  Maintenance interval: {}s",
        config.maintenance_interval.as_secs()
    );

    let mut builder = Engine::builder(config);
    if let Some(dir) = &args.storage_dir {
        let storage = JsonFileStorage::open(dir).await?;
        info!("  Storage dir: {}", storage.dir().display());
        builder = builder.storage(Arc::new(storage));
    }
    let engine = Arc::new(builder.build()?);

    engine.restore().await?;
    engine.on_install().await;
    engine.on_activate().await?;

    let command = args.command.clone().unwrap_or(Command::Serve);
    let result = run_command(&engine, &args, command).await;

    // Drain background work on normal exit so caches are saved complete
    let saved = engine.shutdown(result.is_err()).await?;
    info!("Saved {} caches", saved);
    result
}

async fn run_command(engine: &Arc<Engine>, args: &Args, command: Command) -> Result<()> {
    match command {
        Command::Serve => serve(engine, args).await,
        Command::Fetch { url, navigate } => {
            let request = if navigate {
                RequestDescriptor::navigate(&url)?
            } else {
                RequestDescriptor::get(&url)?
            };
            let response = engine.handle(&request).await?;
            print_json(&FetchOutput {
                status: response.status,
                served_from: response.served_from.to_string(),
                bytes: response.body.len(),
                cache: engine.classify(&request).cache().map(|kind| kind.to_string()),
            })
        }
        Command::Prefetch { urls } => {
            let summary = engine
                .prefetch(urls)
                .await
                .map_err(|e| Error::Internal(format!("Prefetch task failed: {}", e)))?;
            print_json(&summary)
        }
        Command::Purge { cache } => {
            let removed = engine.purge_cache(&cache).await?;
            print_json(&serde_json::json!({ "cache": cache, "removed": removed }))
        }
        Command::Maintain => {
            let reports = engine.trigger_maintenance().await;
            print_json(&reports)
        }
    }
}

#[derive(Serialize)]
struct FetchOutput {
    status: u16,
    served_from: String,
    bytes: usize,
    cache: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(engine: &Arc<Engine>, args: &Args) -> Result<()> {
    let health_engine = engine.clone();
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_engine).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_engine = engine.clone();
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_engine).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("Serving; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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

type HttpResponse = hyper::Response<http_body_util::Full<hyper::body::Bytes>>;

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::body::Bytes>) -> HttpResponse {
    let mut response = hyper::Response::new(http_body_util::Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, engine: Arc<Engine>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
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
        let engine = engine.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = engine.is_active();
                let state = engine.state().to_string();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, state),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Prometheus gauges mirrored from engine statistics on every scrape
struct Exporter {
    registry: prometheus::Registry,
    counters: prometheus::IntGaugeVec,
    hit_ratio: prometheus::Gauge,
    cache_entries: prometheus::IntGaugeVec,
    cache_bytes: prometheus::IntGaugeVec,
    cache_max_bytes: prometheus::IntGaugeVec,
}

impl Exporter {
    fn new() -> std::result::Result<Self, prometheus::Error> {
        use prometheus::{Gauge, IntGaugeVec, Opts, Registry};

        let registry = Registry::new();
        let counters = IntGaugeVec::new(
            Opts::new("edgecache_events_total", "Engine event counters"),
            &["event"],
        )?;
        let hit_ratio = Gauge::new("edgecache_hit_ratio", "Fresh cache hits over lookups")?;
        let cache_entries = IntGaugeVec::new(
            Opts::new("edgecache_cache_entries", "Entries per named cache"),
            &["cache"],
        )?;
        let cache_bytes = IntGaugeVec::new(
            Opts::new("edgecache_cache_bytes", "Payload bytes per named cache"),
            &["cache"],
        )?;
        let cache_max_bytes = IntGaugeVec::new(
            Opts::new("edgecache_cache_max_bytes", "Size bound per named cache"),
            &["cache"],
        )?;

        registry.register(Box::new(counters.clone()))?;
        registry.register(Box::new(hit_ratio.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(cache_bytes.clone()))?;
        registry.register(Box::new(cache_max_bytes.clone()))?;

        Ok(Self {
            registry,
            counters,
            hit_ratio,
            cache_entries,
            cache_bytes,
            cache_max_bytes,
        })
    }

    fn encode(&self, stats: &EngineStats) -> std::result::Result<Vec<u8>, prometheus::Error> {
        use prometheus::{Encoder, TextEncoder};

        let m = &stats.metrics;
        let events = [
            ("cache_hit", m.cache_hits),
            ("cache_miss", m.cache_misses),
            ("network_served", m.network_served),
            ("stale_served", m.stale_served),
            ("offline_served", m.offline_served),
            ("failure", m.failures),
            ("bypass", m.bypassed),
            ("network_error", m.network_errors),
            ("storage_write_error", m.storage_write_errors),
            ("ttl_eviction", m.ttl_evictions),
            ("size_eviction", m.size_evictions),
            ("bytes_evicted", m.bytes_evicted),
            ("sweep", m.sweeps),
            ("revalidation", m.revalidations),
            ("revalidation_failure", m.revalidation_failures),
            ("prefetch_issued", m.prefetch_issued),
            ("prefetch_skipped", m.prefetch_skipped),
            ("prefetch_failed", m.prefetch_failed),
            ("prefetch_hit", m.prefetch_hits),
        ];
        for (event, value) in events {
            self.counters.with_label_values(&[event]).set(value as i64);
        }
        self.hit_ratio.set(m.hit_ratio);

        // Purged caches must disappear from the scrape
        self.cache_entries.reset();
        self.cache_bytes.reset();
        self.cache_max_bytes.reset();
        for cache in &stats.caches {
            let labels = [cache.name.as_str()];
            self.cache_entries
                .with_label_values(&labels)
                .set(cache.entries as i64);
            self.cache_bytes
                .with_label_values(&labels)
                .set(cache.total_bytes as i64);
            self.cache_max_bytes
                .with_label_values(&labels)
                .set(cache.max_bytes as i64);
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

async fn run_metrics_server(addr: &str, engine: Arc<Engine>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let exporter = Arc::new(
        Exporter::new().map_err(|e| Error::Internal(format!("Failed to register metrics: {}", e)))?,
    );

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
        let engine = engine.clone();
        let exporter = exporter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let body = match req.uri().path() {
                    "/metrics" => Some(exporter.encode(&engine.stats())),
                    _ => None,
                };
                async move {
                    let response = match body {
                        Some(Ok(buffer)) => {
                            let mut response = text_response(StatusCode::OK, buffer);
                            if let Ok(value) = TextEncoder::new().format_type().parse() {
                                response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Some(Err(e)) => {
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                        }
                        None => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
