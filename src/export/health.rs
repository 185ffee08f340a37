use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "p2term";

/// Prometheus metrics for the terminal pipeline.
///
/// All metrics use the "p2term" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Total bytes handed to the ingest buffer.
    pub bytes_received: Counter,
    /// Total bytes evicted by ingest overruns.
    pub bytes_dropped: Counter,
    /// Total transport chunks received.
    pub chunks_received: Counter,
    /// Unread bytes in the ingest buffer.
    pub ingest_buffered_bytes: Gauge,
    /// Ingest buffer capacity in bytes.
    pub ingest_capacity_bytes: Gauge,

    // === Routing ===
    /// Records by kind (plain/cog/backtick).
    pub records_by_kind: CounterVec,
    /// Emitted diagnostics by kind.
    pub diagnostics: CounterVec,
    /// Pool slots with outstanding consumers.
    pub pool_slots_in_use: Gauge,
    /// Pool capacity in slots.
    pub pool_slots_capacity: Gauge,
    /// Records waiting for a free slot.
    pub pool_backlog: Gauge,
    /// Current adaptive processing interval.
    pub pacing_interval: Gauge,
    /// Time to route one record to all of its consumers (10us-5ms buckets).
    pub record_processing_duration: Histogram,

    // === Windows ===
    /// Window instances by lifecycle state.
    pub windows_by_state: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let bytes_received = Counter::with_opts(
            Opts::new(
                "bytes_received_total",
                "Total bytes handed to the ingest buffer.",
            )
            .namespace(NAMESPACE),
        )?;
        let bytes_dropped = Counter::with_opts(
            Opts::new(
                "bytes_dropped_total",
                "Total bytes evicted from the ingest buffer by overruns.",
            )
            .namespace(NAMESPACE),
        )?;
        let chunks_received = Counter::with_opts(
            Opts::new("chunks_received_total", "Total transport chunks received.")
                .namespace(NAMESPACE),
        )?;
        let ingest_buffered_bytes = Gauge::with_opts(
            Opts::new(
                "ingest_buffered_bytes",
                "Unread bytes waiting in the ingest buffer.",
            )
            .namespace(NAMESPACE),
        )?;
        let ingest_capacity_bytes = Gauge::with_opts(
            Opts::new("ingest_capacity_bytes", "Ingest buffer capacity in bytes.")
                .namespace(NAMESPACE),
        )?;

        let records_by_kind = CounterVec::new(
            Opts::new("records_total", "Total decoded records by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let diagnostics = CounterVec::new(
            Opts::new("diagnostics_total", "Total diagnostics emitted by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let pool_slots_in_use = Gauge::with_opts(
            Opts::new(
                "pool_slots_in_use",
                "Message pool slots with outstanding consumers.",
            )
            .namespace(NAMESPACE),
        )?;
        let pool_slots_capacity = Gauge::with_opts(
            Opts::new("pool_slots_capacity", "Message pool capacity in slots.")
                .namespace(NAMESPACE),
        )?;
        let pool_backlog = Gauge::with_opts(
            Opts::new(
                "pool_backlog_records",
                "Records waiting for a free message pool slot.",
            )
            .namespace(NAMESPACE),
        )?;
        let pacing_interval = Gauge::with_opts(
            Opts::new(
                "pacing_interval_seconds",
                "Current adaptive processing interval.",
            )
            .namespace(NAMESPACE),
        )?;
        let record_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "record_processing_duration_seconds",
                "Time to route a single record to all of its consumers.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005]),
        )?;

        let windows_by_state = GaugeVec::new(
            Opts::new("windows", "Window instances by lifecycle state.").namespace(NAMESPACE),
            &["state"],
        )?;

        // Ingest
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_dropped.clone()))?;
        registry.register(Box::new(chunks_received.clone()))?;
        registry.register(Box::new(ingest_buffered_bytes.clone()))?;
        registry.register(Box::new(ingest_capacity_bytes.clone()))?;

        // Routing
        registry.register(Box::new(records_by_kind.clone()))?;
        registry.register(Box::new(diagnostics.clone()))?;
        registry.register(Box::new(pool_slots_in_use.clone()))?;
        registry.register(Box::new(pool_slots_capacity.clone()))?;
        registry.register(Box::new(pool_backlog.clone()))?;
        registry.register(Box::new(pacing_interval.clone()))?;
        registry.register(Box::new(record_processing_duration.clone()))?;

        // Windows
        registry.register(Box::new(windows_by_state.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            bytes_received,
            bytes_dropped,
            chunks_received,
            ingest_buffered_bytes,
            ingest_capacity_bytes,
            records_by_kind,
            diagnostics,
            pool_slots_in_use,
            pool_slots_capacity,
            pool_backlog,
            pacing_interval,
            record_processing_duration,
            windows_by_state,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
