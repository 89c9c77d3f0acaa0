//! Pull-based Prometheus metrics for a probe run.
//!
//! Gauges and counters are refreshed from the live probe state on every
//! scrape, so nothing on the write path touches the registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

use crate::allocator::Allocator;
use crate::report::MissingCountByNode;

/// Probe state the metrics are derived from.
#[derive(Debug, Clone)]
pub struct MetricsSource {
    pub allocator: Arc<Allocator>,
    pub results: Arc<MissingCountByNode>,
    pub write_failures: Arc<AtomicU64>,
}

/// Registered metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    events_total: IntCounter,
    events_missing: IntGaugeVec,
    write_failures: IntCounter,
    validation_passes: IntCounterVec,
}

pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let events_total = IntCounter::new("probe_events_total", "Number of events reserved for writing")?;
    registry.register(Box::new(events_total.clone()))?;

    let events_missing = IntGaugeVec::new(
        Opts::new("probe_events_missing", "Number of events missing per node"),
        &["node"],
    )?;
    registry.register(Box::new(events_missing.clone()))?;

    let write_failures = IntCounter::new(
        "probe_write_failures_total",
        "Number of writes lost to non-fatal failures",
    )?;
    registry.register(Box::new(write_failures.clone()))?;

    let validation_passes = IntCounterVec::new(
        Opts::new(
            "probe_validation_passes_total",
            "Number of validation passes per node and verdict",
        ),
        &["node", "verdict"],
    )?;
    registry.register(Box::new(validation_passes.clone()))?;

    Ok(Metrics {
        registry: Arc::new(registry),
        events_total,
        events_missing,
        write_failures,
        validation_passes,
    })
}

fn advance(counter: &IntCounter, current: u64) {
    let delta = current.saturating_sub(counter.get());
    if delta > 0 {
        counter.inc_by(delta);
    }
}

impl Metrics {
    /// Bring every instrument up to date with `source`.
    pub fn refresh(&self, source: &MetricsSource) {
        advance(&self.events_total, source.allocator.count());
        advance(
            &self.write_failures,
            source.write_failures.load(Ordering::Relaxed),
        );
        for (node, missing) in source.results.snapshot() {
            self.events_missing
                .with_label_values(&[node.as_str()])
                .set(missing as i64);
        }
        for ((node, verdict), passes) in source.results.pass_counts() {
            let counter = self
                .validation_passes
                .with_label_values(&[node.as_str(), verdict.as_str()]);
            advance(&counter, passes);
        }
    }

    /// Refresh and render the text exposition format.
    pub fn render(&self, source: &MetricsSource) -> anyhow::Result<Vec<u8>> {
        self.refresh(source);
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encode metrics")?;
        Ok(buffer)
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Metrics,
    source: MetricsSource,
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render(&state.source) {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("failed to encode metrics: {err:#}").into_bytes(),
        ),
    }
}

/// Router serving `GET /metrics`.
pub fn router(metrics: Metrics, source: MetricsSource) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { metrics, source })
}

/// Bind the metrics listener. Done before spawning so a bad address fails
/// the run up front.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener {addr}"))
}

/// Serve `router` on `listener` until `cancel` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "metrics server started");
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::debug!("metrics server shutting down");
        })
        .await
        .context("metrics server")?;
    Ok(())
}
