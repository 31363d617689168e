//! Load simulation against the in-memory ledger
//!
//! Several concurrent senders per account assign nonces and submit through
//! the shared `NonceTransactionsHandler`. Senders recover from nonce gaps by
//! dropping the account's pending transactions, the way a real caller would.
//! Afterwards the run waits until every account has executed everything it
//! was assigned.

use crate::config::SimulationConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::gateway::SimulatedLedger;
use crate::tx::{Address, NonceTransactionsHandler, Transaction};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_GAP_RESETS: u32 = 5;
const SETTLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone, Copy)]
struct SenderStats {
    sent: u64,
    failed: u64,
    gap_resets: u64,
}

impl SenderStats {
    fn merge(&mut self, other: SenderStats) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.gap_resets += other.gap_resets;
    }
}

/// Outcome for one simulated account
#[derive(Debug, Clone)]
pub struct AccountReport {
    pub address: Address,
    pub chain_nonce: u64,
    pub executed: usize,
    pub sent: u64,
    pub failed: u64,
    pub gap_resets: u64,
    pub settled: bool,
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub accounts: Vec<AccountReport>,
    pub elapsed: Duration,
}

impl SimulationReport {
    pub fn all_settled(&self) -> bool {
        self.accounts.iter().all(|account| account.settled)
    }
}

pub struct Simulation {
    config: SimulationConfig,
    ledger: Arc<SimulatedLedger>,
    handler: Arc<NonceTransactionsHandler>,
}

impl Simulation {
    pub fn new(
        config: SimulationConfig,
        ledger: Arc<SimulatedLedger>,
        handler: Arc<NonceTransactionsHandler>,
    ) -> Self {
        Self {
            config,
            ledger,
            handler,
        }
    }

    /// Simulated accounts, one distinct 32-byte address each
    pub fn accounts(&self) -> Vec<Address> {
        (0..self.config.accounts)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[24..].copy_from_slice(&(i as u64 + 1).to_be_bytes());
                Address::from(bytes)
            })
            .collect()
    }

    pub async fn run(&self, shutdown: &CancellationToken) -> RelayerResult<SimulationReport> {
        let started = Instant::now();
        let accounts = self.accounts();
        info!(
            "Simulating {} accounts x {} senders x {} transactions",
            accounts.len(),
            self.config.senders_per_account,
            self.config.transactions_per_sender
        );

        let mut tasks = Vec::new();
        for address in &accounts {
            for sender in 0..self.config.senders_per_account {
                let handler = self.handler.clone();
                let address = address.clone();
                let chain_id = self.config.chain_id.clone();
                let count = self.config.transactions_per_sender;
                let shutdown = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    let stats =
                        run_sender(&handler, &address, &chain_id, sender, count, &shutdown).await;
                    (address, stats)
                }));
            }
        }

        let mut stats: HashMap<Address, SenderStats> = HashMap::new();
        for task in tasks {
            let (address, result) = task
                .await
                .map_err(|e| RelayerError::Internal(format!("sender task failed: {}", e)))?;
            stats.entry(address).or_default().merge(result?);
        }

        if shutdown.is_cancelled() {
            return Err(RelayerError::Cancelled);
        }

        let settled = self.settle(&accounts, shutdown).await?;

        let reports = accounts
            .into_iter()
            .map(|address| {
                let stats = stats.get(&address).copied().unwrap_or_default();
                AccountReport {
                    chain_nonce: self.ledger.nonce_of(&address),
                    executed: self.ledger.executed(&address).len(),
                    sent: stats.sent,
                    failed: stats.failed,
                    gap_resets: stats.gap_resets,
                    settled: settled.get(&address).copied().unwrap_or(false),
                    address,
                }
            })
            .collect();

        Ok(SimulationReport {
            accounts: reports,
            elapsed: started.elapsed(),
        })
    }

    /// Wait for every account to execute all assigned nonces. An account
    /// whose chain nonce does not move between two polls is unstuck with a
    /// drop and a filler transaction.
    async fn settle(
        &self,
        accounts: &[Address],
        shutdown: &CancellationToken,
    ) -> RelayerResult<HashMap<Address, bool>> {
        let deadline = Instant::now() + self.config.settle_timeout();
        let mut last_seen: HashMap<Address, u64> = HashMap::new();
        let mut fillers = 0u64;

        loop {
            let mut settled = HashMap::new();
            for address in accounts {
                let done = self
                    .account_settled(address, &mut last_seen, &mut fillers, shutdown)
                    .await?;
                settled.insert(address.clone(), done);
            }

            if settled.values().all(|done| *done) {
                info!("All accounts settled");
                return Ok(settled);
            }
            if Instant::now() >= deadline {
                warn!("Settle timeout reached with unsettled accounts");
                return Ok(settled);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Err(RelayerError::Cancelled),
                _ = sleep(SETTLE_POLL) => {}
            }
        }
    }

    async fn account_settled(
        &self,
        address: &Address,
        last_seen: &mut HashMap<Address, u64>,
        fillers: &mut u64,
        shutdown: &CancellationToken,
    ) -> RelayerResult<bool> {
        let Some(snapshot) = self.handler.snapshot(address).await else {
            return Ok(true);
        };
        let chain_nonce = self.ledger.nonce_of(address);
        let Some(computed) = snapshot.computed_nonce else {
            return Ok(self.ledger.mempool_nonces(address).is_empty());
        };

        if chain_nonce > computed && self.ledger.mempool_nonces(address).is_empty() {
            last_seen.remove(address);
            return Ok(true);
        }

        // Reconciliation only resends above the chain nonce, so a lost
        // transaction at the chain nonce stalls the account until a drop
        let stalled = snapshot.queued == 0
            && last_seen.insert(address.clone(), chain_nonce) == Some(chain_nonce);
        if stalled {
            warn!(
                "Account {} stalled at nonce {} (computed {}), dropping",
                address, chain_nonce, computed
            );
            last_seen.remove(address);
            self.handler.drop_transactions(address).await?;
            *fillers += 1;
            let memo = format!("filler-{}", fillers);
            let mut txs = vec![draft(address, &self.config.chain_id, &memo)];
            self.handler.apply_nonce_and_gas_price(address, &mut txs).await?;
            let tx = txs.remove(0);
            if let Err(e) = self.handler.send_transaction(tx, shutdown).await {
                warn!("Filler transaction for {} failed: {}", address, e);
            }
        }

        debug!(
            "Account {} not settled: chain nonce {}, computed {}, pending {:?}",
            address, chain_nonce, computed, snapshot.pending_nonces
        );
        Ok(false)
    }
}

fn draft(sender: &Address, chain_id: &str, memo: &str) -> Transaction {
    Transaction {
        sender: sender.clone(),
        receiver: Address::from(vec![0xfe; 32]),
        value: 1,
        gas_limit: 50_000,
        data: memo.as_bytes().to_vec(),
        chain_id: chain_id.to_string(),
        version: 1,
        ..Default::default()
    }
}

async fn run_sender(
    handler: &NonceTransactionsHandler,
    address: &Address,
    chain_id: &str,
    sender: usize,
    count: usize,
    shutdown: &CancellationToken,
) -> RelayerResult<SenderStats> {
    let mut stats = SenderStats::default();

    for i in 0..count {
        let mut txs = vec![draft(address, chain_id, &format!("sender-{}-tx-{}", sender, i))];

        let mut resets = 0;
        loop {
            match handler.apply_nonce_and_gas_price(address, &mut txs).await {
                Ok(()) => break,
                Err(e) if e.requires_reset() && resets < MAX_GAP_RESETS => {
                    warn!("Sender {} on {}: {}, dropping", sender, address, e);
                    handler.drop_transactions(address).await?;
                    resets += 1;
                    stats.gap_resets += 1;
                }
                Err(e) => return Err(e),
            }
        }

        match handler.send_transaction(txs.remove(0), shutdown).await {
            Ok(_) => stats.sent += 1,
            Err(e) if e.is_cancellation() => return Ok(stats),
            Err(e) if e.is_retryable() => {
                debug!(
                    "Sender {} on {}: send failed, left to reconciliation: {}",
                    sender, address, e
                );
                stats.failed += 1;
            }
            Err(e) => {
                warn!("Sender {} on {}: send failed: {}", sender, address, e);
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}
