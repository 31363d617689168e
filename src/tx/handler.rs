//! Process-wide registry of per-account nonce handlers
//!
//! Handlers and their submission workers are created lazily on first use of
//! an account. A background loop periodically reconciles every tracked
//! account with the chain and resends whatever is still outstanding.

use super::events::{EventSink, NonceEvent};
use super::nonce::{AddressNonceHandler, NonceSnapshot};
use super::sender::TransactionWorker;
use super::types::{Address, Transaction};
use crate::error::{RelayerError, RelayerResult};
use crate::gateway::LedgerGateway;
use crate::metrics::Metrics;

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest accepted reconciliation interval
pub const MIN_RESEND_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(60);
/// How often an idle submission worker checks its queue
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(50);
const MIN_SEND_INTERVAL: Duration = Duration::from_millis(1);

/// Builder for `NonceTransactionsHandler`
pub struct NonceHandlerBuilder {
    gateway: Option<Arc<dyn LedgerGateway>>,
    resend_interval: Duration,
    send_interval: Duration,
    events: EventSink,
    metrics: Option<Arc<Metrics>>,
}

impl Default for NonceHandlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceHandlerBuilder {
    pub fn new() -> Self {
        Self {
            gateway: None,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            send_interval: DEFAULT_SEND_INTERVAL,
            events: EventSink::disabled(),
            metrics: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn LedgerGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Interval of the reconciliation loop, also used as the per-account
    /// timeout of each pass. Must be at least one second.
    pub fn with_resend_interval(mut self, resend_interval: Duration) -> Self {
        self.resend_interval = resend_interval;
        self
    }

    /// Poll interval of the per-account submission workers
    pub fn with_send_interval(mut self, send_interval: Duration) -> Self {
        self.send_interval = send_interval;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the options and start the reconciliation loop. Must be called
    /// from within a tokio runtime.
    pub fn build(self) -> RelayerResult<NonceTransactionsHandler> {
        let gateway = self.gateway.ok_or(RelayerError::MissingGateway)?;

        if self.resend_interval < MIN_RESEND_INTERVAL {
            return Err(RelayerError::InvalidInterval {
                name: "resend interval",
                min: MIN_RESEND_INTERVAL,
                got: self.resend_interval,
            });
        }
        if self.send_interval < MIN_SEND_INTERVAL {
            return Err(RelayerError::InvalidInterval {
                name: "send interval",
                min: MIN_SEND_INTERVAL,
                got: self.send_interval,
            });
        }

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new()?),
        };

        let inner = Arc::new(RegistryInner {
            gateway,
            handlers: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            resend_interval: self.resend_interval,
            send_interval: self.send_interval,
            shutdown: CancellationToken::new(),
            events: self.events,
            metrics,
        });

        let resend_loop = tokio::spawn(inner.clone().run_resend_loop());
        info!(
            "Nonce handler started (resend every {:?}, send every {:?})",
            inner.resend_interval, inner.send_interval
        );

        Ok(NonceTransactionsHandler {
            inner,
            resend_loop: Mutex::new(Some(resend_loop)),
        })
    }
}

struct RegistryInner {
    gateway: Arc<dyn LedgerGateway>,
    handlers: DashMap<Address, Arc<AddressNonceHandler>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    resend_interval: Duration,
    send_interval: Duration,
    shutdown: CancellationToken,
    events: EventSink,
    metrics: Arc<Metrics>,
}

/// Entry point for callers: assigns nonces, sends transactions and keeps
/// every used account reconciled with the chain.
pub struct NonceTransactionsHandler {
    inner: Arc<RegistryInner>,
    resend_loop: Mutex<Option<JoinHandle<()>>>,
}

impl NonceTransactionsHandler {
    pub fn builder() -> NonceHandlerBuilder {
        NonceHandlerBuilder::new()
    }

    /// Get the handler for an account, creating it (and starting its
    /// submission worker) on first use. Must be called from within a tokio
    /// runtime.
    pub fn address_handler(&self, address: &Address) -> RelayerResult<Arc<AddressNonceHandler>> {
        if address.is_empty() {
            return Err(RelayerError::InvalidAddress("empty address".to_string()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(RelayerError::Closed);
        }
        Ok(self.inner.get_or_create(address))
    }

    /// Assign consecutive nonces and the gas floor to a batch of transactions
    /// from one account
    pub async fn apply_nonce_and_gas_price(
        &self,
        address: &Address,
        txs: &mut [Transaction],
    ) -> RelayerResult<()> {
        if txs.is_empty() {
            return Err(RelayerError::NoTransactions);
        }
        let handler = self.address_handler(address)?;
        for tx in txs.iter_mut() {
            handler.apply_nonce_and_gas_price(tx).await?;
        }
        Ok(())
    }

    /// Send one transaction through its sender's queue and wait for the hash
    pub async fn send_transaction(
        &self,
        tx: Transaction,
        cancel: &CancellationToken,
    ) -> RelayerResult<String> {
        let handler = self.address_handler(&tx.sender)?;
        handler.send_transaction(tx, cancel).await
    }

    /// Enqueue every transaction first, then wait for all of them. Returns the
    /// hashes in input order, or the first error.
    pub async fn send_transactions(
        &self,
        txs: Vec<Transaction>,
        cancel: &CancellationToken,
    ) -> RelayerResult<Vec<String>> {
        if txs.is_empty() {
            return Err(RelayerError::NoTransactions);
        }

        let mut waiting = Vec::with_capacity(txs.len());
        for tx in txs {
            let handler = self.address_handler(&tx.sender)?;
            let receiver = handler.submit(tx).await?;
            waiting.push((handler, receiver));
        }

        let mut hashes = Vec::with_capacity(waiting.len());
        for (handler, receiver) in waiting {
            hashes.push(handler.wait_for_result(receiver, cancel).await?);
        }
        Ok(hashes)
    }

    /// Discard an account's pending transactions and raise its gas floor
    pub async fn drop_transactions(&self, address: &Address) -> RelayerResult<()> {
        self.address_handler(address)?.drop_transactions().await
    }

    pub fn tracked_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .inner
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// State of an account, if it has been used
    pub async fn snapshot(&self, address: &Address) -> Option<NonceSnapshot> {
        let handler = self.inner.handlers.get(address)?.value().clone();
        Some(handler.snapshot().await)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop the reconciliation loop and every submission worker. Waiting
    /// senders get a cancellation error. Calling it again is a no-op.
    pub async fn close(&self) -> RelayerResult<()> {
        self.inner.shutdown.cancel();

        let resend_loop = lock(&self.resend_loop).take();
        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        if resend_loop.is_none() && workers.is_empty() {
            return Ok(());
        }

        if let Some(handle) = resend_loop {
            handle
                .await
                .map_err(|e| RelayerError::Internal(format!("resend loop failed: {}", e)))?;
        }
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Submission worker failed: {}", e);
            }
        }

        info!("Nonce handler closed");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RegistryInner {
    fn get_or_create(&self, address: &Address) -> Arc<AddressNonceHandler> {
        if let Some(handler) = self.handlers.get(address) {
            return handler.value().clone();
        }

        // The entry lock makes creation happen once under a race
        self.handlers
            .entry(address.clone())
            .or_insert_with(|| {
                debug!("Tracking new account {}", address);
                let worker = TransactionWorker::new(
                    address.clone(),
                    self.gateway.clone(),
                    self.send_interval,
                    self.shutdown.clone(),
                    self.events.clone(),
                    self.metrics.clone(),
                );
                lock(&self.workers).push(worker.start());
                Arc::new(AddressNonceHandler::new(
                    address.clone(),
                    self.gateway.clone(),
                    worker,
                    self.shutdown.clone(),
                    self.events.clone(),
                    self.metrics.clone(),
                ))
            })
            .value()
            .clone()
    }

    async fn run_resend_loop(self: Arc<Self>) {
        let mut ticker = interval(self.resend_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = self.resend_all() => {}
                    }
                }
            }
        }

        info!("Resend loop stopped");
    }

    /// One reconciliation pass over every tracked account. Accounts run
    /// concurrently and a failure in one never affects the others.
    async fn resend_all(&self) {
        let handlers: Vec<Arc<AddressNonceHandler>> = self
            .handlers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if handlers.is_empty() {
            return;
        }

        debug!("Reconciling {} accounts", handlers.len());
        join_all(handlers.iter().map(|handler| self.resend_one(handler))).await;
    }

    async fn resend_one(&self, handler: &AddressNonceHandler) {
        let result = match timeout(
            self.resend_interval,
            handler.resend_transactions_if_required(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RelayerError::Timeout {
                operation: format!("resend for {}", handler.address()),
            }),
        };

        if let Err(e) = result {
            warn!("Reconciliation failed for {}: {}", handler.address(), e);
            self.metrics.record_reconciliation_failure(handler.address());
            self.events.emit(NonceEvent::ReconciliationFailed {
                address: handler.address().clone(),
                error: e.to_string(),
            });
        }
    }
}
