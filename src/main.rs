//! CoucheCache daemon
//!
//! Runs the caching subsystem's background machinery (warming sweeps,
//! registry health polling, pushed invalidations) and exposes health,
//! invalidation and metrics endpoints. With `--redis-url` every instance
//! shares one Redis tier and its stampede locks.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          couchecache                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Warming    │───▶│ Tiered Cache │◀───│ Invalidation │       │
//! │  │   Engine     │    │    Core      │    │   Router     │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │        │                    │                                   │
//! │   registry health     /healthz /readyz /metrics                 │
//! │                       POST /invalidate  POST /events            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use couchecache::adapters::{
    HttpServiceRegistry, HttpSource, PrometheusExporter, RedisSharedTier, StaticServiceRegistry,
};
use couchecache::domain::ports::ServiceRegistry;
use couchecache::error::{Error, Result};
use couchecache::ingress::{Ingress, IngressReply, MAX_BODY_BYTES};
use couchecache::{CacheSettings, CacheSubsystem, InvalidationRule};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CoucheCache - multi-tier adaptive caching subsystem
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "COUCHECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// YAML invalidation rule table (replaces the built-in table)
    #[arg(long, env = "COUCHECACHE_RULES")]
    rules: Option<PathBuf>,

    /// Override the default fresh TTL in seconds
    #[arg(long, env = "FRESH_TTL_SECONDS")]
    fresh_ttl_seconds: Option<u64>,

    /// Override the warming worker count
    #[arg(long, env = "MAX_CONCURRENT_WARMING_WORKERS")]
    max_concurrent_warming_workers: Option<usize>,

    /// Redis URL for the shared tier; without it the shared tier is in-process
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Service registry base URL; without it every source is considered unhealthy
    #[arg(long, env = "SERVICE_REGISTRY_URL")]
    registry_url: Option<String>,

    /// Service registry request timeout in milliseconds
    #[arg(long, env = "SERVICE_REGISTRY_TIMEOUT_MS", default_value = "2000")]
    registry_timeout_ms: u64,

    /// Pushed invalidation channel capacity
    #[arg(long, env = "INVALIDATION_QUEUE_CAPACITY", default_value = "1024")]
    invalidation_queue_capacity: usize,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn settings(&self) -> Result<CacheSettings> {
        let mut settings = match &self.config {
            Some(path) => CacheSettings::load(path)?,
            None => CacheSettings::default(),
        };
        if let Some(ttl) = self.fresh_ttl_seconds {
            settings.fresh_ttl_seconds = ttl;
        }
        if let Some(workers) = self.max_concurrent_warming_workers {
            settings.max_concurrent_warming_workers = workers;
        }
        settings.validate()?;
        Ok(settings)
    }

    fn registry(&self) -> Result<Arc<dyn ServiceRegistry>> {
        match &self.registry_url {
            Some(url) => Ok(Arc::new(HttpServiceRegistry::new(
                url.clone(),
                Duration::from_millis(self.registry_timeout_ms),
            )?)),
            None => Ok(Arc::new(StaticServiceRegistry::new())),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting CoucheCache");
    info!("  Config file: {:?}", args.config);
    info!("  Service registry: {:?}", args.registry_url);

    let settings = args.settings()?;
    info!(
        "  Fresh TTL: {}s (stale x{})",
        settings.fresh_ttl_seconds, settings.stale_ttl_multiplier
    );

    let redis = match &args.redis_url {
        Some(url) => Some(Arc::new(RedisSharedTier::connect(url, &settings).await?)),
        None => {
            warn!("No Redis URL configured, shared tier is local to this process");
            None
        }
    };
    let source = HttpSource::new(settings.fetch_timeout())?;

    let mut builder = CacheSubsystem::builder(settings).registry(args.registry()?);
    if let Some(redis) = redis {
        builder = builder.shared_tier(redis.clone(), redis);
    }
    if let Some(path) = &args.rules {
        let raw = std::fs::read_to_string(path)?;
        let rules = InvalidationRule::from_yaml(&raw)?;
        info!("  Invalidation rules: {} from {:?}", rules.len(), path);
        builder = builder.invalidation_rules(rules);
    }

    let subsystem = Arc::new(builder.build()?);
    let exporter = Arc::new(PrometheusExporter::new()?);
    let servers = CancellationToken::new();

    let catalog = subsystem.register_warming_catalog(|item| source.fetcher(&item.url));
    info!("  Warming catalog: {} items", catalog);
    subsystem.spawn_warming();
    let ingress = Ingress::new(
        Arc::clone(&subsystem),
        subsystem.spawn_invalidation_consumer(args.invalidation_queue_capacity),
    );

    let health = tokio::spawn(serve(
        args.health_addr.clone(),
        servers.clone(),
        Arc::new({
            let subsystem = Arc::clone(&subsystem);
            move |req: Request<Incoming>| {
                let subsystem = Arc::clone(&subsystem);
                let ingress = ingress.clone();
                async move { health_handler(req, &subsystem, &ingress).await }
            }
        }),
    ));

    let metrics = tokio::spawn(serve(
        args.metrics_addr.clone(),
        servers.clone(),
        Arc::new({
            let subsystem = Arc::clone(&subsystem);
            let exporter = Arc::clone(&exporter);
            move |req: Request<Incoming>| {
                let subsystem = Arc::clone(&subsystem);
                let exporter = Arc::clone(&exporter);
                async move { metrics_handler(req, &subsystem, &exporter) }
            }
        }),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    subsystem.shutdown().await;
    servers.cancel();
    for (name, handle) in [("health", health), ("metrics", metrics)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
        }
    }

    info!("CoucheCache shutdown complete");
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
    for directive in ["hyper=warn", "reqwest=info"] {
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
// HTTP Servers
// =============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn not_found() -> HttpResponse {
    respond(StatusCode::NOT_FOUND, "text/plain", "not found")
}

async fn health_handler(
    req: Request<Incoming>,
    subsystem: &CacheSubsystem,
    ingress: &Ingress,
) -> std::result::Result<HttpResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let response = match (&method, path.as_str()) {
        (_, "/healthz" | "/livez") => respond(StatusCode::OK, "text/plain", "ok"),
        (_, "/readyz") => {
            let report = subsystem.health().await;
            let status = if report.is_ready() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            match serde_json::to_vec(&report) {
                Ok(body) => respond(status, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("failed to encode health report: {}", e),
                ),
            }
        }
        (&Method::POST, "/invalidate") => match read_body(req).await {
            Ok(body) => reply(ingress.invalidate(&body)),
            Err(response) => response,
        },
        (&Method::POST, "/events") => match read_body(req).await {
            Ok(body) => reply(ingress.service_event(&body).await),
            Err(response) => response,
        },
        _ => not_found(),
    };
    Ok(response)
}

/// Collect a request body up to [`MAX_BODY_BYTES`]
async fn read_body(req: Request<Incoming>) -> std::result::Result<Bytes, HttpResponse> {
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(respond(
            StatusCode::PAYLOAD_TOO_LARGE,
            "text/plain",
            format!("unreadable request body: {}", e),
        )),
    }
}

fn reply(reply: IngressReply) -> HttpResponse {
    respond(reply.status, "application/json", reply.body)
}

fn metrics_handler(
    req: Request<Incoming>,
    subsystem: &CacheSubsystem,
    exporter: &PrometheusExporter,
) -> std::result::Result<HttpResponse, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            exporter.update(&subsystem.metrics());
            match exporter.encode() {
                Ok(body) => respond(StatusCode::OK, exporter.content_type(), body),
                Err(e) => {
                    warn!("Failed to encode metrics: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
                }
            }
        }
        _ => not_found(),
    };
    Ok(response)
}

/// Accept HTTP/1 connections on `addr` until `shutdown` fires
async fn serve<H, Fut>(addr: String, shutdown: CancellationToken, handler: Arc<H>) -> Result<()>
where
    H: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<HttpResponse, Infallible>> + Send + 'static,
{
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid bind address {}: {}", addr, e)))?;

    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        let io = TokioIo::new(stream);
        let handler = Arc::clone(&handler);

        tokio::spawn(async move {
            let service = service_fn(move |req| handler(req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("HTTP connection error: {}", e);
            }
        });
    }

    info!("HTTP server on {} stopped", addr);
    Ok(())
}
