use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hx_core::{AnalysisResult, TABLE};
use hx_store::backend::memory::MemoryBackend;
use hx_store::backend::TableBackend;
use hx_store::{AnalysisRecordService, QueryPerformanceMonitor, StoreConfig};

mod api;
mod exporter;
mod simulate;

use exporter::QueryCounters;
use simulate::AnalysisGenerator;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "hx-hub", version, about = "HALLUX analysis record hub")]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "hx-hub.toml")]
    config: PathBuf,

    /// JSON file with an array of analyses to load at startup
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Generate this many demo analyses at startup
    #[arg(long, default_value_t = 0)]
    demo_rows: usize,

    /// Owner of the generated demo analyses
    #[arg(long, default_value = "demo-user")]
    demo_user: String,

    /// Serve as if no aggregation routine were deployed
    #[arg(long)]
    no_routines: bool,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone, Debug)]
struct Config {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    server: ServerConfig,
}

#[derive(Deserialize, Clone, Debug)]
struct ServerConfig {
    #[serde(default = "default_cors")]
    cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { cors: true }
    }
}

fn default_cors() -> bool {
    true
}

fn load_config(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to read config {:?}: {}", path, e);
            return Config::default();
        }
    };
    toml::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!("Invalid config {:?}, using defaults: {}", path, e);
        Config::default()
    })
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    service: AnalysisRecordService,
    backend: Arc<MemoryBackend>,
    counters: Arc<QueryCounters>,
    start_time: Instant,
    routines: bool,
}

impl AppState {
    fn new(
        service: AnalysisRecordService,
        backend: Arc<MemoryBackend>,
        counters: Arc<QueryCounters>,
        routines: bool,
    ) -> Self {
        Self {
            service,
            backend,
            counters,
            start_time: Instant::now(),
            routines,
        }
    }
}

/// Hub state over an empty in-memory backend with default store settings.
#[cfg(test)]
pub(crate) fn test_state() -> Arc<AppState> {
    let backend = Arc::new(MemoryBackend::new());
    let counters = Arc::new(QueryCounters::new(hx_store::monitor::DEFAULT_SLOW_QUERY_THRESHOLD_MS));
    let monitor = Arc::new(QueryPerformanceMonitor::default().with_sink(counters.clone()));
    let table: Arc<dyn TableBackend> = backend.clone();
    let service = AnalysisRecordService::new(table, monitor, &StoreConfig::default());
    Arc::new(AppState::new(service, backend, counters, true))
}

#[derive(Serialize)]
struct HubStatus {
    version: &'static str,
    backend: &'static str,
    routines_enabled: bool,
    uptime_seconds: u64,
    stored_analyses: usize,
    queries_observed: u64,
    slow_query_threshold_ms: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "hx_hub=info,hx_store=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args.config);

    let counters = Arc::new(QueryCounters::new(config.store.slow_query_threshold_ms));
    let monitor = Arc::new(
        QueryPerformanceMonitor::new(
            config.store.metrics_capacity,
            config.store.slow_query_threshold_ms,
        )
        .with_sink(counters.clone()),
    );

    let backend = if args.no_routines {
        Arc::new(MemoryBackend::new().without_routines())
    } else {
        Arc::new(MemoryBackend::new())
    };
    let table: Arc<dyn TableBackend> = backend.clone();
    let service = AnalysisRecordService::new(table, monitor, &config.store);

    if let Some(path) = &args.seed {
        match load_seed(path) {
            Ok(results) => match service.save_batch(results).await {
                Ok(report) => tracing::info!("Seeded {} analyses from {:?}", report.rows_written, path),
                Err(e) => tracing::error!("Failed to seed from {:?}: {}", path, e),
            },
            Err(e) => tracing::error!("Failed to read seed file {:?}: {}", path, e),
        }
    }

    if args.demo_rows > 0 {
        let results = AnalysisGenerator::from_entropy().generate(
            &args.demo_user,
            args.demo_rows,
            90,
            chrono::Utc::now(),
        );
        match service.save_batch(results).await {
            Ok(report) => tracing::info!(
                "Generated {} demo analyses for '{}'",
                report.rows_written,
                args.demo_user
            ),
            Err(e) => tracing::error!("Failed to generate demo analyses: {}", e),
        }
    }

    let state = Arc::new(AppState::new(service, backend, counters, !args.no_routines));

    let mut app = Router::new()
        .route("/api/status", get(api_status))
        .route(
            "/api/analyses",
            get(api::list_analyses)
                .post(api::create_analysis)
                .delete(api::delete_analyses),
        )
        .route(
            "/api/analyses/batch",
            post(api::save_batch).put(api::update_batch),
        )
        .route("/api/analyses/search", get(api::search_analyses))
        .route("/api/analyses/:id", get(api::get_analysis))
        .route("/api/batches/:id", get(api::get_batch))
        .route("/api/scans/:id", get(api::get_scan))
        .route("/api/dashboard", get(api::dashboard))
        .route("/api/analytics", get(api::analytics))
        .route("/api/statistics", get(api::statistics))
        .route("/api/simulate", post(api::simulate))
        .route(
            "/api/metrics/queries",
            get(api::query_metrics).delete(api::clear_query_metrics),
        )
        .route("/metrics", get(api_metrics_prometheus))
        .with_state(state);

    if config.server.cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr: SocketAddr = match args.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid bind address {}: {}", args.bind, e);
            std::process::exit(1);
        }
    };
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  HALLUX record hub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  API:        http://{}/api/status", addr);
    tracing::info!("  Metrics:    http://{}/metrics", addr);
    tracing::info!("  Routines:   {}", if args.no_routines { "disabled" } else { "enabled" });
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn load_seed(path: &Path) -> Result<Vec<AnalysisResult>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

// =============================================================================
// Core API Handlers
// =============================================================================

async fn api_status(State(state): State<Arc<AppState>>) -> Json<HubStatus> {
    Json(HubStatus {
        version: env!("CARGO_PKG_VERSION"),
        backend: "memory",
        routines_enabled: state.routines,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        stored_analyses: state.backend.row_count(TABLE).await,
        queries_observed: state.counters.queries_total(),
        slow_query_threshold_ms: state.service.monitor().slow_query_threshold_ms(),
    })
}

async fn api_metrics_prometheus(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.service.monitor().report().await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        exporter::render(&state.counters, &report),
    )
}
