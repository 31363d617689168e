//! Per-account submission queue
//!
//! Transactions are pushed onto a min-heap keyed by nonce and drained by one
//! background task per account. Ordering is decided at drain time, so a
//! transaction enqueued late but with a lower nonce still goes out before
//! the higher ones that are waiting next to it.

use crate::error::{RelayerError, RelayerResult};
use crate::gateway::LedgerGateway;
use crate::metrics::Metrics;

use super::events::{EventSink, NonceEvent};
use super::types::{Address, Transaction};

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome delivered to whoever enqueued the transaction
pub type SendResult = RelayerResult<String>;

/// Queue entry: the transaction and the channel its result goes to
struct QueuedTransaction {
    tx: Transaction,
    /// Arrival order, breaks ties between equal nonces
    seq: u64,
    responder: oneshot::Sender<SendResult>,
}

impl PartialEq for QueuedTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTransaction {}

impl PartialOrd for QueuedTransaction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTransaction {
    // Reversed: BinaryHeap pops the greatest, we want the lowest nonce
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .tx
            .nonce
            .cmp(&self.tx.nonce)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTransaction>,
    next_seq: u64,
}

struct WorkerInner {
    address: Address,
    gateway: Arc<dyn LedgerGateway>,
    queue: Mutex<QueueState>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    events: EventSink,
    metrics: Arc<Metrics>,
}

/// Nonce-ordered submission queue with one dedicated worker task
#[derive(Clone)]
pub struct TransactionWorker {
    inner: Arc<WorkerInner>,
}

impl TransactionWorker {
    /// Create a worker. Nothing is sent until `start` is called.
    pub fn new(
        address: Address,
        gateway: Arc<dyn LedgerGateway>,
        poll_interval: Duration,
        shutdown: CancellationToken,
        events: EventSink,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                address,
                gateway,
                queue: Mutex::new(QueueState::default()),
                poll_interval,
                shutdown,
                events,
                metrics,
            }),
        }
    }

    /// Spawn the drain loop. It runs until the shutdown token is cancelled.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run().await })
    }

    /// Push a transaction and return the receiver for its result. Never
    /// blocks on the network.
    pub fn enqueue(&self, tx: Transaction) -> oneshot::Receiver<SendResult> {
        let (responder, receiver) = oneshot::channel();
        let mut queue = self.inner.lock_queue();

        if self.inner.shutdown.is_cancelled() {
            let _ = responder.send(Err(RelayerError::Closed));
            return receiver;
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;
        debug!(
            "Enqueued nonce {} for {} (queue depth {})",
            tx.nonce,
            self.inner.address,
            queue.heap.len() + 1
        );
        queue.heap.push(QueuedTransaction { tx, seq, responder });
        self.inner
            .metrics
            .set_queue_depth(&self.inner.address, queue.heap.len());

        receiver
    }

    /// Number of transactions waiting to be sent
    pub fn len(&self) -> usize {
        self.inner.lock_queue().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkerInner {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        // Never held across an await
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(&self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Submission worker started for {}", self.address);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.drain().await,
            }
        }

        self.abort_pending();
        info!("Submission worker stopped for {}", self.address);
    }

    /// Send everything currently queued, lowest nonce first. The heap is
    /// re-read after every send so late arrivals with lower nonces jump ahead.
    async fn drain(&self) {
        while let Some(entry) = self.pop() {
            self.process(entry).await;
            if self.shutdown.is_cancelled() {
                break;
            }
        }
    }

    fn pop(&self) -> Option<QueuedTransaction> {
        let mut queue = self.lock_queue();
        let entry = queue.heap.pop();
        if entry.is_some() {
            self.metrics.set_queue_depth(&self.address, queue.heap.len());
        }
        entry
    }

    async fn process(&self, entry: QueuedTransaction) {
        let QueuedTransaction { tx, responder, .. } = entry;

        let result = tokio::select! {
            result = self.gateway.send_transaction(&tx) => result,
            _ = self.shutdown.cancelled() => Err(RelayerError::Cancelled),
        };

        match &result {
            Ok(hash) => {
                debug!("Sent nonce {} for {}: {}", tx.nonce, self.address, hash);
                self.metrics.record_tx_sent(&self.address);
                self.events.emit(NonceEvent::TransactionSent {
                    address: self.address.clone(),
                    nonce: tx.nonce,
                    hash: hash.clone(),
                });
            }
            Err(e) => {
                warn!("Failed to send nonce {} for {}: {}", tx.nonce, self.address, e);
                self.metrics.record_tx_failed(&self.address);
                self.events.emit(NonceEvent::TransactionSendFailed {
                    address: self.address.clone(),
                    nonce: tx.nonce,
                    error: e.to_string(),
                });
            }
        }

        if responder.send(result).is_err() {
            debug!(
                "Caller for nonce {} on {} stopped waiting, result discarded",
                tx.nonce, self.address
            );
        }
    }

    /// Fail whatever is still queued once the worker stops
    fn abort_pending(&self) {
        let pending = std::mem::take(&mut self.lock_queue().heap);
        if !pending.is_empty() {
            debug!(
                "Cancelling {} queued transactions for {}",
                pending.len(),
                self.address
            );
        }
        for entry in pending {
            let _ = entry.responder.send(Err(RelayerError::Cancelled));
        }
        self.metrics.set_queue_depth(&self.address, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockLedgerGateway, SimulatedLedger};
    use tokio_test::assert_err;

    fn alice() -> Address {
        Address::from(vec![0x0a; 32])
    }

    fn tx(nonce: u64) -> Transaction {
        Transaction {
            nonce,
            sender: alice(),
            receiver: Address::from(vec![0x0b; 32]),
            gas_price: 1_000,
            gas_limit: 50_000,
            ..Default::default()
        }
    }

    fn worker(gateway: Arc<dyn LedgerGateway>, shutdown: CancellationToken) -> TransactionWorker {
        TransactionWorker::new(
            alice(),
            gateway,
            Duration::from_millis(5),
            shutdown,
            EventSink::disabled(),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_sends_in_ascending_nonce_order() {
        let ledger = Arc::new(SimulatedLedger::new("T", 1_000));
        let shutdown = CancellationToken::new();
        let worker = worker(ledger.clone(), shutdown.clone());

        let receivers: Vec<_> = [91, 1, 13, 10, 99, 8, 7]
            .into_iter()
            .map(|nonce| worker.enqueue(tx(nonce)))
            .collect();
        assert_eq!(worker.len(), 7);

        let handle = worker.start();
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }

        assert_eq!(
            ledger.submitted_nonces(&alice()),
            vec![1, 7, 8, 10, 13, 91, 99]
        );
        assert!(worker.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_error_reaches_caller() {
        let mut gateway = MockLedgerGateway::new();
        gateway
            .expect_send_transaction()
            .times(1)
            .returning(|_| Err(RelayerError::Gateway("nonce too low".into())));

        let shutdown = CancellationToken::new();
        let worker = worker(Arc::new(gateway), shutdown.clone());
        let handle = worker.start();

        let result = worker.enqueue(tx(3)).await.unwrap();
        assert!(matches!(result, Err(RelayerError::Gateway(ref m)) if m == "nonce too low"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_entry_is_still_sent() {
        let ledger = Arc::new(SimulatedLedger::new("T", 1_000));
        let shutdown = CancellationToken::new();
        let worker = worker(ledger.clone(), shutdown.clone());

        drop(worker.enqueue(tx(0)));
        let handle = worker.start();
        assert!(worker.enqueue(tx(1)).await.unwrap().is_ok());

        assert_eq!(ledger.submitted_nonces(&alice()), vec![0, 1]);
        assert_eq!(ledger.nonce_of(&alice()), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_entries() {
        let ledger = Arc::new(SimulatedLedger::new("T", 1_000));
        let shutdown = CancellationToken::new();
        let worker = TransactionWorker::new(
            alice(),
            ledger.clone(),
            Duration::from_secs(3600),
            shutdown.clone(),
            EventSink::disabled(),
            Arc::new(Metrics::new().unwrap()),
        );
        let handle = worker.start();
        // Let the immediate first tick pass on an empty queue
        tokio::task::yield_now().await;

        let rx = worker.enqueue(tx(0));
        shutdown.cancel();
        handle.await.unwrap();

        assert!(matches!(rx.await.unwrap(), Err(RelayerError::Cancelled)));
        assert!(ledger.submitted_nonces(&alice()).is_empty());

        let late = worker.enqueue(tx(1)).await.unwrap();
        assert_err!(&late);
        assert!(late.unwrap_err().is_cancellation());
    }
}
