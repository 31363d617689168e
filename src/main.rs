//! Nonce Relayer - soak run against the in-memory ledger
//!
//! Drives concurrent senders through the nonce handler, with a ledger that
//! loses submissions, and reports whether every account settled.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nonce_relayer::config::Settings;
use nonce_relayer::metrics::{Metrics, MetricsServer};
use nonce_relayer::simulation::Simulation;
use nonce_relayer::{EventSink, NonceEvent, NonceTransactionsHandler, SimulatedLedger};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Nonce Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: resend every {:?}, send every {:?}",
        settings.nonce_handler.resend_interval(),
        settings.nonce_handler.send_interval()
    );

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(Metrics::new()?);

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port, metrics.clone());
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let ledger = Arc::new(
        SimulatedLedger::new(
            &settings.simulation.chain_id,
            settings.simulation.min_gas_price,
        )
        .with_drop_every(settings.simulation.drop_every),
    );

    // Surface handler diagnostics through the log
    let (events, mut event_rx) = EventSink::channel();
    let events_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                NonceEvent::ReconciliationFailed { address, error } => {
                    warn!("Reconciliation failed for {}: {}", address, error)
                }
                NonceEvent::TransactionsDropped { address, gas_price } => {
                    info!("Dropped transactions for {}, gas price {}", address, gas_price)
                }
                other => tracing::trace!("{:?}", other),
            }
        }
    });

    let handler = Arc::new(
        NonceTransactionsHandler::builder()
            .with_gateway(ledger.clone())
            .with_resend_interval(settings.nonce_handler.resend_interval())
            .with_send_interval(settings.nonce_handler.send_interval())
            .with_events(events)
            .with_metrics(metrics.clone())
            .build()?,
    );

    info!("Nonce Relayer is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    let simulation = Simulation::new(settings.simulation.clone(), ledger, handler.clone());

    let outcome = tokio::select! {
        result = simulation.run(&shutdown) => Some(result),
        _ = shutdown_signal() => None,
    };

    match outcome {
        Some(Ok(report)) => {
            for account in &report.accounts {
                info!(
                    "{}: chain nonce {}, executed {}, sent {}, failed {}, gap resets {}, settled {}",
                    account.address,
                    account.chain_nonce,
                    account.executed,
                    account.sent,
                    account.failed,
                    account.gap_resets,
                    account.settled
                );
            }
            if report.all_settled() {
                info!("Simulation finished in {:?}", report.elapsed);
            } else {
                warn!("Simulation finished in {:?} with unsettled accounts", report.elapsed);
            }
        }
        Some(Err(e)) => error!("Simulation failed: {}", e),
        None => info!("Shutdown signal received, stopping..."),
    }

    // Graceful shutdown
    shutdown.cancel();
    handler.close().await?;

    if let Some(h) = metrics_handle {
        if let Err(e) = h.await {
            error!("Metrics server task failed: {}", e);
        }
    }
    events_handle.abort();

    info!("Nonce Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nonce_relayer=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
