//! Prometheus metrics for monitoring
//!
//! Exposes per-account metrics for:
//! - Nonce assignment and gap detection
//! - Submission queue throughput
//! - Reconciliation resends and failures
//!
//! Each `Metrics` instance owns its own `Registry`, so several handlers (or
//! tests) in one process never share counters.

use crate::error::RelayerResult;
use crate::tx::Address;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Metrics {
    registry: Registry,
    nonces_applied: IntCounterVec,
    gap_errors: IntCounterVec,
    duplicates_rejected: IntCounterVec,
    tx_sent: IntCounterVec,
    tx_failed: IntCounterVec,
    tx_resent: IntCounterVec,
    drops: IntCounterVec,
    reconciliation_failures: IntCounterVec,
    pending_transactions: IntGaugeVec,
    queue_depth: IntGaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> RelayerResult<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["address"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> RelayerResult<IntGaugeVec> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), &["address"])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Metrics {
    pub fn new() -> RelayerResult<Self> {
        let registry = Registry::new();

        Ok(Self {
            nonces_applied: counter(
                &registry,
                "nonce_relayer_nonces_applied_total",
                "Total nonces assigned to transactions",
            )?,
            gap_errors: counter(
                &registry,
                "nonce_relayer_gap_errors_total",
                "Total nonce gaps detected",
            )?,
            duplicates_rejected: counter(
                &registry,
                "nonce_relayer_duplicates_rejected_total",
                "Total duplicate transactions rejected",
            )?,
            tx_sent: counter(
                &registry,
                "nonce_relayer_transactions_sent_total",
                "Total transactions accepted by the gateway",
            )?,
            tx_failed: counter(
                &registry,
                "nonce_relayer_transactions_failed_total",
                "Total transactions rejected by the gateway",
            )?,
            tx_resent: counter(
                &registry,
                "nonce_relayer_transactions_resent_total",
                "Total transactions resent by reconciliation",
            )?,
            drops: counter(
                &registry,
                "nonce_relayer_drops_total",
                "Total explicit transaction drops",
            )?,
            reconciliation_failures: counter(
                &registry,
                "nonce_relayer_reconciliation_failures_total",
                "Total failed reconciliation passes",
            )?,
            pending_transactions: gauge(
                &registry,
                "nonce_relayer_pending_transactions",
                "Transactions sent but not yet confirmed",
            )?,
            queue_depth: gauge(
                &registry,
                "nonce_relayer_queue_depth",
                "Transactions waiting in the submission queue",
            )?,
            registry,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> RelayerResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::error::RelayerError::Internal(e.to_string()))
    }

    pub fn record_nonce_applied(&self, address: &Address) {
        self.nonces_applied
            .with_label_values(&[&address.to_string()])
            .inc();
    }

    pub fn record_gap(&self, address: &Address) {
        self.gap_errors.with_label_values(&[&address.to_string()]).inc();
    }

    pub fn record_duplicate(&self, address: &Address) {
        self.duplicates_rejected
            .with_label_values(&[&address.to_string()])
            .inc();
    }

    pub fn record_tx_sent(&self, address: &Address) {
        self.tx_sent.with_label_values(&[&address.to_string()]).inc();
    }

    pub fn record_tx_failed(&self, address: &Address) {
        self.tx_failed.with_label_values(&[&address.to_string()]).inc();
    }

    pub fn record_tx_resent(&self, address: &Address, count: usize) {
        self.tx_resent
            .with_label_values(&[&address.to_string()])
            .inc_by(count as u64);
    }

    pub fn record_drop(&self, address: &Address) {
        self.drops.with_label_values(&[&address.to_string()]).inc();
    }

    pub fn record_reconciliation_failure(&self, address: &Address) {
        self.reconciliation_failures
            .with_label_values(&[&address.to_string()])
            .inc();
    }

    pub fn set_pending(&self, address: &Address, pending: usize) {
        self.pending_transactions
            .with_label_values(&[&address.to_string()])
            .set(pending as i64);
    }

    pub fn set_queue_depth(&self, address: &Address, depth: usize) {
        self.queue_depth
            .with_label_values(&[&address.to_string()])
            .set(depth as i64);
    }

    pub fn gap_errors(&self, address: &Address) -> u64 {
        self.gap_errors.with_label_values(&[&address.to_string()]).get()
    }

    pub fn transactions_resent(&self, address: &Address) -> u64 {
        self.tx_resent.with_label_values(&[&address.to_string()]).get()
    }
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
    metrics: Arc<Metrics>,
}

impl MetricsServer {
    pub fn new(port: u16, metrics: Arc<Metrics>) -> Self {
        Self { port, metrics }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> RelayerResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(self.metrics.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
