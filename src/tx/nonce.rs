//! Nonce management for one account
//!
//! Handles:
//! - Local nonce tracking seeded from the chain
//! - Nonce gap detection (never auto-corrected)
//! - Duplicate detection and fee-bumped replacement
//! - Resending outstanding transactions and explicit drops with gas escalation

use super::events::{EventSink, NonceEvent};
use super::gas::GasPriceFloor;
use super::sender::{SendResult, TransactionWorker};
use super::types::{Address, Fingerprint, Transaction};
use crate::error::{RelayerError, RelayerResult};
use crate::gateway::LedgerGateway;
use crate::metrics::Metrics;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How far the lowest outstanding nonce may run ahead of the chain nonce
/// before it counts as a gap. Right after a reconciliation pass the lowest
/// outstanding nonce is normally `chain_nonce + 1`.
pub const GAP_MARGIN: u64 = 1;

/// A transaction handed to the submission queue and not yet confirmed
struct PendingTransaction {
    tx: Transaction,
    fingerprint: Fingerprint,
}

/// Mutable per-account state, only touched under the handler's lock
struct NonceState {
    /// Last nonce handed out. `None` until seeded from the chain, and again
    /// after a drop.
    computed_nonce: Option<u64>,
    /// Lowest nonce still believed unconfirmed
    lowest_nonce: u64,
    gas: GasPriceFloor,
    /// Pending transactions by nonce
    transactions: BTreeMap<u64, PendingTransaction>,
}

impl NonceState {
    fn new() -> Self {
        Self {
            computed_nonce: None,
            lowest_nonce: 0,
            gas: GasPriceFloor::new(),
            transactions: BTreeMap::new(),
        }
    }

    fn find_sent(&self, fingerprint: &Fingerprint) -> Option<&Transaction> {
        self.transactions
            .values()
            .find(|pending| &pending.fingerprint == fingerprint)
            .map(|pending| &pending.tx)
    }
}

/// Point-in-time view of an account's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSnapshot {
    pub address: Address,
    pub computed_nonce: Option<u64>,
    pub lowest_nonce: u64,
    pub gas_price: Option<u64>,
    pub pending_nonces: Vec<u64>,
    pub queued: usize,
}

/// Nonce, gas price and pending-transaction bookkeeping for exactly one
/// account. Every operation takes the account lock, so nonce assignment is
/// serialized per account while other accounts proceed independently.
pub struct AddressNonceHandler {
    address: Address,
    gateway: Arc<dyn LedgerGateway>,
    worker: TransactionWorker,
    state: Mutex<NonceState>,
    shutdown: CancellationToken,
    events: EventSink,
    metrics: Arc<Metrics>,
}

impl AddressNonceHandler {
    /// Create a handler around an existing submission worker. The worker must
    /// be started by the caller.
    pub fn new(
        address: Address,
        gateway: Arc<dyn LedgerGateway>,
        worker: TransactionWorker,
        shutdown: CancellationToken,
        events: EventSink,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            address,
            gateway,
            worker,
            state: Mutex::new(NonceState::new()),
            shutdown,
            events,
            metrics,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Assign the next nonce and the current gas floor to a transaction.
    ///
    /// A transaction identical to one already pending keeps that nonce if it
    /// offers a higher gas price (replacement), and is rejected otherwise.
    /// Fails with `GapNonce` when the lowest nonce we still consider
    /// outstanding is more than `GAP_MARGIN` ahead of the chain; nothing is
    /// mutated in that case.
    pub async fn apply_nonce_and_gas_price(&self, tx: &mut Transaction) -> RelayerResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if self.reuse_sent_nonce(state, tx)? {
            return Ok(());
        }

        let account = self.gateway.get_account(&self.address).await?;
        let chain_nonce = account.nonce;

        if state.lowest_nonce > chain_nonce.saturating_add(GAP_MARGIN) {
            warn!(
                "Nonce gap detected for {}: chain nonce {}, lowest outstanding {}",
                self.address, chain_nonce, state.lowest_nonce
            );
            self.metrics.record_gap(&self.address);
            self.events.emit(NonceEvent::GapDetected {
                address: self.address.clone(),
                chain_nonce,
                lowest_nonce: state.lowest_nonce,
            });
            return Err(RelayerError::GapNonce {
                address: self.address.to_string(),
                chain_nonce,
                lowest_nonce: state.lowest_nonce,
            });
        }

        let nonce = match state.computed_nonce {
            None => chain_nonce,
            Some(computed) => (computed + 1).max(chain_nonce),
        };

        if state.gas.needs_refresh(nonce) {
            let network = self.gateway.get_network_config().await?;
            debug!(
                "Fetched minimum gas price {} for {}",
                network.min_gas_price, self.address
            );
            state.gas.refresh(network.min_gas_price);
        }

        state.computed_nonce = Some(nonce);
        tx.nonce = nonce;
        state.gas.apply(tx);

        debug!(
            "Allocated nonce {} for {} (chain nonce {}, gas price {})",
            nonce, self.address, chain_nonce, tx.gas_price
        );
        self.metrics.record_nonce_applied(&self.address);
        self.events.emit(NonceEvent::NonceApplied {
            address: self.address.clone(),
            nonce,
            gas_price: tx.gas_price,
        });

        Ok(())
    }

    /// Handle a transaction whose receiver, payload and value match a pending
    /// one. Returns `true` when the old nonce was reused.
    fn reuse_sent_nonce(&self, state: &NonceState, tx: &mut Transaction) -> RelayerResult<bool> {
        let Some(old) = state.find_sent(&tx.fingerprint()) else {
            return Ok(false);
        };

        if old.gas_price < tx.gas_price {
            debug!(
                "Replacing nonce {} for {} with gas price {} (was {})",
                old.nonce, self.address, tx.gas_price, old.gas_price
            );
            tx.nonce = old.nonce;
            return Ok(true);
        }

        let floor = state.gas.current().unwrap_or(0);
        if old.gas_price == tx.gas_price && old.gas_price < floor {
            debug!(
                "Re-pricing nonce {} for {} to floor {}",
                old.nonce, self.address, floor
            );
            tx.nonce = old.nonce;
            tx.gas_price = floor;
            return Ok(true);
        }

        warn!(
            "Transaction already sent for {} with nonce {}",
            self.address, old.nonce
        );
        self.metrics.record_duplicate(&self.address);
        self.events.emit(NonceEvent::DuplicateRejected {
            address: self.address.clone(),
            nonce: old.nonce,
        });
        Err(RelayerError::TxAlreadySent {
            address: self.address.to_string(),
            nonce: old.nonce,
        })
    }

    /// Whether an identical transaction (receiver, payload, value) is pending
    pub async fn is_tx_already_sent(&self, tx: &Transaction) -> bool {
        self.state
            .lock()
            .await
            .find_sent(&tx.fingerprint())
            .is_some()
    }

    /// Record the transaction as pending and enqueue it, then wait for the
    /// submission result, the caller's cancellation, or shutdown.
    pub async fn send_transaction(
        &self,
        tx: Transaction,
        cancel: &CancellationToken,
    ) -> RelayerResult<String> {
        let receiver = self.submit(tx).await?;
        self.wait_for_result(receiver, cancel).await
    }

    /// Register and enqueue without waiting for the result
    pub(crate) async fn submit(
        &self,
        tx: Transaction,
    ) -> RelayerResult<oneshot::Receiver<SendResult>> {
        if self.shutdown.is_cancelled() {
            return Err(RelayerError::Closed);
        }

        {
            let mut state = self.state.lock().await;
            let replaced = state.transactions.insert(
                tx.nonce,
                PendingTransaction {
                    fingerprint: tx.fingerprint(),
                    tx: tx.clone(),
                },
            );
            if replaced.is_some() {
                debug!("Replaced pending nonce {} for {}", tx.nonce, self.address);
            }
            self.metrics
                .set_pending(&self.address, state.transactions.len());
        }

        Ok(self.worker.enqueue(tx))
    }

    pub(crate) async fn wait_for_result(
        &self,
        receiver: oneshot::Receiver<SendResult>,
        cancel: &CancellationToken,
    ) -> RelayerResult<String> {
        tokio::select! {
            // Sender dropped means the worker went away before sending
            result = receiver => result.unwrap_or(Err(RelayerError::Cancelled)),
            _ = cancel.cancelled() => Err(RelayerError::Cancelled),
            _ = self.shutdown.cancelled() => Err(RelayerError::Cancelled),
        }
    }

    /// Reconcile with the chain: forget confirmed transactions and resend
    /// the ones still outstanding as a single batch.
    pub async fn resend_transactions_if_required(&self) -> RelayerResult<()> {
        let account = self.gateway.get_account(&self.address).await?;
        let chain_nonce = account.nonce;

        let resendable: Vec<Transaction> = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if state.computed_nonce == Some(chain_nonce) {
                let confirmed = state.transactions.len();
                state.transactions.clear();
                state.lowest_nonce = chain_nonce;
                self.metrics.set_pending(&self.address, 0);
                if confirmed > 0 {
                    debug!(
                        "All {} transactions confirmed for {} at nonce {}",
                        confirmed, self.address, chain_nonce
                    );
                    self.events.emit(NonceEvent::TransactionsConfirmed {
                        address: self.address.clone(),
                        chain_nonce,
                    });
                }
                return Ok(());
            }

            // Everything up to the chain nonce counts as confirmed
            state.transactions.retain(|nonce, _| *nonce > chain_nonce);
            state.lowest_nonce = state
                .transactions
                .keys()
                .next()
                .copied()
                .or(state.computed_nonce)
                .unwrap_or(chain_nonce);
            self.metrics
                .set_pending(&self.address, state.transactions.len());

            state
                .transactions
                .values()
                .map(|pending| pending.tx.clone())
                .collect()
        };

        if resendable.is_empty() {
            return Ok(());
        }

        let nonces: Vec<u64> = resendable.iter().map(|tx| tx.nonce).collect();
        let hashes = self.gateway.send_transactions(&resendable).await?;

        info!(
            "Resent {} transactions for {} (chain nonce {}): {:?}",
            resendable.len(),
            self.address,
            chain_nonce,
            nonces
        );
        self.metrics.record_tx_resent(&self.address, resendable.len());
        self.events.emit(NonceEvent::TransactionsResent {
            address: self.address.clone(),
            nonces,
            hashes,
        });

        Ok(())
    }

    /// Forget every pending transaction, re-seed the nonce from the chain on
    /// next use and raise the gas floor so replacements can evict whatever
    /// is stuck in the network's pool.
    pub async fn drop_transactions(&self) -> RelayerResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let network_min = match state.gas.current() {
            Some(price) => price,
            None => self.gateway.get_network_config().await?.min_gas_price,
        };

        let dropped = state.transactions.len();
        state.transactions.clear();
        let gas_price = state.gas.escalate(network_min, state.computed_nonce);
        state.computed_nonce = None;
        state.lowest_nonce = 0;

        info!(
            "Dropped {} pending transactions for {}, gas price floor now {}",
            dropped, self.address, gas_price
        );
        self.metrics.record_drop(&self.address);
        self.metrics.set_pending(&self.address, 0);
        self.events.emit(NonceEvent::TransactionsDropped {
            address: self.address.clone(),
            gas_price,
        });

        Ok(())
    }

    pub async fn snapshot(&self) -> NonceSnapshot {
        let state = self.state.lock().await;
        NonceSnapshot {
            address: self.address.clone(),
            computed_nonce: state.computed_nonce,
            lowest_nonce: state.lowest_nonce,
            gas_price: state.gas.current(),
            pending_nonces: state.transactions.keys().copied().collect(),
            queued: self.worker.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Account, MockLedgerGateway, NetworkConfig, SimulatedLedger};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio_test::{assert_err, assert_ok};

    const MIN_GAS_PRICE: u64 = 1_000_000_000;

    fn alice() -> Address {
        Address::from(vec![0xa1; 32])
    }

    fn draft(data: &str) -> Transaction {
        Transaction {
            sender: alice(),
            receiver: Address::from(vec![0xb0; 32]),
            value: 1,
            gas_limit: 50_000,
            data: data.as_bytes().to_vec(),
            chain_id: "T".to_string(),
            version: 1,
            ..Default::default()
        }
    }

    fn handler(
        gateway: Arc<dyn LedgerGateway>,
        poll_interval: Duration,
        shutdown: &CancellationToken,
    ) -> (Arc<AddressNonceHandler>, JoinHandle<()>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let worker = TransactionWorker::new(
            alice(),
            gateway.clone(),
            poll_interval,
            shutdown.clone(),
            EventSink::disabled(),
            metrics.clone(),
        );
        let handle = worker.start();
        let handler = AddressNonceHandler::new(
            alice(),
            gateway,
            worker,
            shutdown.clone(),
            EventSink::disabled(),
            metrics,
        );
        (Arc::new(handler), handle)
    }

    /// Mock whose chain nonce is read from a shared counter and which
    /// accepts every single send
    fn chain_mock(chain_nonce: Arc<AtomicU64>) -> MockLedgerGateway {
        let mut gateway = MockLedgerGateway::new();
        gateway.expect_get_account().returning(move |address| {
            Ok(Account {
                address: address.clone(),
                nonce: chain_nonce.load(Ordering::SeqCst),
                balance: 0,
            })
        });
        gateway.expect_get_network_config().returning(|| {
            Ok(NetworkConfig {
                chain_id: "T".to_string(),
                min_gas_price: MIN_GAS_PRICE,
                min_gas_limit: 50_000,
            })
        });
        gateway
            .expect_send_transaction()
            .returning(|tx| Ok(format!("hash-{}", tx.nonce)));
        gateway
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_apply_is_contiguous() {
        let ledger = Arc::new(SimulatedLedger::new("T", MIN_GAS_PRICE));
        ledger.set_nonce(&alice(), 7);
        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(ledger, Duration::from_millis(5), &shutdown);

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let mut tx = draft(&format!("transfer-{}", i));
                    handler.apply_nonce_and_gas_price(&mut tx).await.map(|_| tx)
                })
            })
            .collect();

        let mut nonces = HashSet::new();
        for task in tasks {
            let tx = task.await.unwrap().unwrap();
            assert_eq!(tx.gas_price, MIN_GAS_PRICE);
            assert!(nonces.insert(tx.nonce), "nonce {} assigned twice", tx.nonce);
        }
        assert_eq!(nonces, (7..57).collect::<HashSet<_>>());
        assert_eq!(handler.snapshot().await.computed_nonce, Some(56));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_apply_never_goes_below_chain_nonce() {
        let chain = Arc::new(AtomicU64::new(3));
        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(
            Arc::new(chain_mock(chain.clone())),
            Duration::from_millis(5),
            &shutdown,
        );

        let mut tx = draft("a");
        assert_ok!(handler.apply_nonce_and_gas_price(&mut tx).await);
        assert_eq!(tx.nonce, 3);

        // Account used from somewhere else
        chain.store(10, Ordering::SeqCst);
        let mut tx = draft("b");
        assert_ok!(handler.apply_nonce_and_gas_price(&mut tx).await);
        assert_eq!(tx.nonce, 10);

        let mut tx = draft("c");
        assert_ok!(handler.apply_nonce_and_gas_price(&mut tx).await);
        assert_eq!(tx.nonce, 11);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_gap_nonce_leaves_state_untouched() {
        let chain = Arc::new(AtomicU64::new(105));
        let mut gateway = chain_mock(chain.clone());
        gateway
            .expect_send_transactions()
            .returning(|txs| Ok(txs.iter().map(|tx| format!("hash-{}", tx.nonce)).collect()));
        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(Arc::new(gateway), Duration::from_millis(5), &shutdown);
        let never = CancellationToken::new();

        // Nonces 105 and 106 assigned and sent
        for data in ["a", "b"] {
            let mut tx = draft(data);
            handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();
            handler.send_transaction(tx, &never).await.unwrap();
        }

        // Chain reports 104: both stay outstanding, lowest becomes 105
        chain.store(104, Ordering::SeqCst);
        handler.resend_transactions_if_required().await.unwrap();
        assert_eq!(handler.snapshot().await.lowest_nonce, 105);

        chain.store(100, Ordering::SeqCst);
        let mut tx = draft("c");
        let err = handler.apply_nonce_and_gas_price(&mut tx).await.unwrap_err();
        assert!(matches!(
            err,
            RelayerError::GapNonce {
                chain_nonce: 100,
                lowest_nonce: 105,
                ..
            }
        ));
        assert_eq!(tx.nonce, 0);

        let snapshot = handler.snapshot().await;
        assert_eq!(snapshot.computed_nonce, Some(106));
        assert_eq!(snapshot.pending_nonces, vec![105, 106]);

        // The gap is re-evaluated on every call
        chain.store(105, Ordering::SeqCst);
        assert_ok!(handler.apply_nonce_and_gas_price(&mut tx).await);
        assert_eq!(tx.nonce, 107);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_resend_only_outstanding() {
        let chain = Arc::new(AtomicU64::new(102));
        let mut gateway = chain_mock(chain.clone());
        gateway
            .expect_send_transactions()
            .times(1)
            .withf(|txs| txs.iter().map(|tx| tx.nonce).collect::<Vec<_>>() == vec![104, 105])
            .returning(|txs| Ok(txs.iter().map(|tx| format!("hash-{}", tx.nonce)).collect()));

        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(Arc::new(gateway), Duration::from_millis(5), &shutdown);
        let never = CancellationToken::new();

        for data in ["n102", "n103", "n104", "n105"] {
            let mut tx = draft(data);
            handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();
            handler.send_transaction(tx, &never).await.unwrap();
        }
        let snapshot = handler.snapshot().await;
        assert_eq!(snapshot.computed_nonce, Some(105));
        assert_eq!(snapshot.pending_nonces, vec![102, 103, 104, 105]);

        // 102 and 103 count as confirmed, only 104 and 105 go out again
        chain.store(103, Ordering::SeqCst);
        handler.resend_transactions_if_required().await.unwrap();

        let snapshot = handler.snapshot().await;
        assert_eq!(snapshot.pending_nonces, vec![104, 105]);
        assert_eq!(snapshot.lowest_nonce, 104);

        // Lowest outstanding one ahead of the chain is normal traffic, not a gap
        let mut tx = draft("n106");
        assert_ok!(handler.apply_nonce_and_gas_price(&mut tx).await);
        assert_eq!(tx.nonce, 106);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_resend_is_idempotent_once_confirmed() {
        let chain = Arc::new(AtomicU64::new(0));
        let mut gateway = chain_mock(chain.clone());
        gateway.expect_send_transactions().never();

        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(Arc::new(gateway), Duration::from_millis(5), &shutdown);
        let never = CancellationToken::new();

        for data in ["a", "b", "c"] {
            let mut tx = draft(data);
            handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();
            handler.send_transaction(tx, &never).await.unwrap();
        }
        assert_eq!(handler.snapshot().await.pending_nonces, vec![0, 1, 2]);

        chain.store(2, Ordering::SeqCst);
        assert_ok!(handler.resend_transactions_if_required().await);
        let first = handler.snapshot().await;
        assert!(first.pending_nonces.is_empty());
        assert_eq!(first.lowest_nonce, 2);

        assert_ok!(handler.resend_transactions_if_required().await);
        assert_eq!(handler.snapshot().await, first);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_drop_escalates_gas_and_reseeds() {
        let ledger = Arc::new(SimulatedLedger::new("T", MIN_GAS_PRICE));
        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(ledger.clone(), Duration::from_millis(5), &shutdown);

        // Drop before anything was fetched still raises above the network minimum
        handler.drop_transactions().await.unwrap();
        let mut last = handler.snapshot().await.gas_price.unwrap();
        assert!(last > MIN_GAS_PRICE);

        let mut tx = draft("a");
        handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();
        assert_eq!(tx.nonce, 0);
        assert_eq!(tx.gas_price, last);

        for _ in 0..3 {
            handler.drop_transactions().await.unwrap();
            let current = handler.snapshot().await.gas_price.unwrap();
            assert!(current > last);
            last = current;
        }

        let snapshot = handler.snapshot().await;
        assert_eq!(snapshot.computed_nonce, None);
        assert_eq!(snapshot.lowest_nonce, 0);
        assert!(snapshot.pending_nonces.is_empty());

        // Re-seeded from the chain
        ledger.set_nonce(&alice(), 4);
        let mut tx = draft("b");
        handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();
        assert_eq!(tx.nonce, 4);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_escalated_floor_expires_after_window() {
        let ledger = Arc::new(SimulatedLedger::new("T", MIN_GAS_PRICE));
        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(ledger, Duration::from_millis(5), &shutdown);

        for data in ["a", "b"] {
            let mut tx = draft(data);
            handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();
        }
        handler.drop_transactions().await.unwrap();

        // Chain never saw 0 and 1, so they are handed out again at the raised price
        let mut prices = Vec::new();
        for data in ["c", "d", "e"] {
            let mut tx = draft(data);
            handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();
            prices.push((tx.nonce, tx.gas_price));
        }
        assert_eq!(
            prices,
            vec![
                (0, MIN_GAS_PRICE + 1),
                (1, MIN_GAS_PRICE + 1),
                (2, MIN_GAS_PRICE)
            ]
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_rejected_without_consuming_nonce() {
        let ledger = Arc::new(SimulatedLedger::new("T", MIN_GAS_PRICE));
        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(ledger, Duration::from_millis(5), &shutdown);
        let never = CancellationToken::new();

        let mut tx = draft("pay");
        handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();
        handler.send_transaction(tx.clone(), &never).await.unwrap();
        assert!(handler.is_tx_already_sent(&draft("pay")).await);
        assert!(!handler.is_tx_already_sent(&draft("other")).await);

        let mut again = draft("pay");
        let err = handler.apply_nonce_and_gas_price(&mut again).await;
        assert_err!(&err);
        assert!(matches!(err, Err(RelayerError::TxAlreadySent { nonce: 0, .. })));
        assert_eq!(handler.snapshot().await.computed_nonce, Some(0));

        // Higher fee: replacement at the same nonce
        let mut bumped = draft("pay");
        bumped.gas_price = MIN_GAS_PRICE * 2;
        handler.apply_nonce_and_gas_price(&mut bumped).await.unwrap();
        assert_eq!(bumped.nonce, 0);
        assert_eq!(handler.snapshot().await.computed_nonce, Some(0));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_gateway_error_propagates() {
        let mut gateway = MockLedgerGateway::new();
        gateway
            .expect_get_account()
            .returning(|_| Err(RelayerError::Gateway("503 service unavailable".into())));

        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(Arc::new(gateway), Duration::from_millis(5), &shutdown);

        let mut tx = draft("a");
        let err = handler.apply_nonce_and_gas_price(&mut tx).await.unwrap_err();
        assert_eq!(err.to_string(), "Gateway error: 503 service unavailable");
        assert_eq!(handler.snapshot().await.computed_nonce, None);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_caller_cancellation_keeps_entry_queued() {
        let ledger = Arc::new(SimulatedLedger::new("T", MIN_GAS_PRICE));
        let shutdown = CancellationToken::new();
        let (handler, _worker) = handler(ledger, Duration::from_secs(3600), &shutdown);
        // Let the immediate first tick pass on an empty queue
        tokio::task::yield_now().await;

        let mut tx = draft("a");
        handler.apply_nonce_and_gas_price(&mut tx).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handler.send_transaction(tx, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayerError::Cancelled));

        let snapshot = handler.snapshot().await;
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.pending_nonces, vec![0]);

        shutdown.cancel();
    }
}
