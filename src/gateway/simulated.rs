//! In-memory ledger that executes transactions in nonce order

use super::{Account, LedgerGateway, NetworkConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::tx::{Address, Transaction};

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Per-account ledger state
#[derive(Default)]
struct AccountLedger {
    /// Next nonce to execute
    nonce: u64,
    /// Accepted transactions waiting for their turn, by nonce
    mempool: BTreeMap<u64, Transaction>,
    executed: Vec<Transaction>,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<Address, AccountLedger>,
    /// Every submission that passed validation, in arrival order
    submissions: Vec<Transaction>,
    unavailable: HashSet<Address>,
    account_queries: u64,
}

/// Simulated ledger gateway.
///
/// Transactions are validated the way a node would (gas floor, nonce too
/// low, underpriced replacement), kept in a per-account mempool and executed
/// as soon as the expected nonce is present. With `drop_every(n)` every n-th
/// accepted submission is acknowledged but silently lost, which leaves the
/// account stuck until it is resent.
pub struct SimulatedLedger {
    config: NetworkConfig,
    drop_every: Option<u64>,
    state: Mutex<LedgerState>,
}

impl SimulatedLedger {
    pub fn new(chain_id: &str, min_gas_price: u64) -> Self {
        Self {
            config: NetworkConfig {
                chain_id: chain_id.to_string(),
                min_gas_price,
                min_gas_limit: 50_000,
            },
            drop_every: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Lose every n-th accepted submission
    pub fn with_drop_every(mut self, n: u64) -> Self {
        self.drop_every = if n == 0 { None } else { Some(n) };
        self
    }

    /// Set the expected nonce of an account, as if it had executed elsewhere
    pub fn set_nonce(&self, address: &Address, nonce: u64) {
        let mut state = self.lock();
        let account = state.accounts.entry(address.clone()).or_default();
        account.nonce = nonce;
        account.mempool.retain(|n, _| *n >= nonce);
        Self::execute_ready(account);
    }

    /// Make every call touching this account fail
    pub fn set_unavailable(&self, address: &Address, unavailable: bool) {
        let mut state = self.lock();
        if unavailable {
            state.unavailable.insert(address.clone());
        } else {
            state.unavailable.remove(address);
        }
    }

    /// Expected nonce of an account
    pub fn nonce_of(&self, address: &Address) -> u64 {
        self.lock()
            .accounts
            .get(address)
            .map(|a| a.nonce)
            .unwrap_or(0)
    }

    /// Nonces of accepted submissions for an account, in arrival order
    pub fn submitted_nonces(&self, address: &Address) -> Vec<u64> {
        self.lock()
            .submissions
            .iter()
            .filter(|tx| &tx.sender == address)
            .map(|tx| tx.nonce)
            .collect()
    }

    /// Transactions executed for an account, in execution order
    pub fn executed(&self, address: &Address) -> Vec<Transaction> {
        self.lock()
            .accounts
            .get(address)
            .map(|a| a.executed.clone())
            .unwrap_or_default()
    }

    /// Nonces sitting in the mempool, waiting for an earlier nonce
    pub fn mempool_nonces(&self, address: &Address) -> Vec<u64> {
        self.lock()
            .accounts
            .get(address)
            .map(|a| a.mempool.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of `get_account` calls served
    pub fn account_queries(&self) -> u64 {
        self.lock().account_queries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // A panic while holding the lock only happens in a failing test
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn submit(&self, tx: &Transaction) -> RelayerResult<String> {
        let mut state = self.lock();

        if state.unavailable.contains(&tx.sender) {
            return Err(RelayerError::Gateway(format!(
                "account {} unavailable",
                tx.sender
            )));
        }
        if tx.gas_price < self.config.min_gas_price {
            return Err(RelayerError::Gateway(format!(
                "insufficient gas price: have {}, need {}",
                tx.gas_price, self.config.min_gas_price
            )));
        }

        let hash = transaction_hash(tx);
        let account = state.accounts.entry(tx.sender.clone()).or_default();

        if tx.nonce < account.nonce {
            return Err(RelayerError::Gateway(format!(
                "nonce too low: have {}, expected at least {}",
                tx.nonce, account.nonce
            )));
        }
        if let Some(existing) = account.mempool.get(&tx.nonce) {
            if existing == tx {
                return Ok(hash);
            }
            if existing.gas_price >= tx.gas_price {
                return Err(RelayerError::Gateway(format!(
                    "replacement transaction underpriced: nonce {}, pending gas price {}",
                    tx.nonce, existing.gas_price
                )));
            }
        }

        state.submissions.push(tx.clone());
        let accepted = state.submissions.len() as u64;
        if let Some(n) = self.drop_every {
            if accepted % n == 0 {
                debug!("Simulated ledger lost transaction {} with nonce {}", hash, tx.nonce);
                return Ok(hash);
            }
        }

        let account = state.accounts.entry(tx.sender.clone()).or_default();
        account.mempool.insert(tx.nonce, tx.clone());
        Self::execute_ready(account);

        Ok(hash)
    }

    fn execute_ready(account: &mut AccountLedger) {
        while let Some(tx) = account.mempool.remove(&account.nonce) {
            account.executed.push(tx);
            account.nonce += 1;
        }
    }
}

fn transaction_hash(tx: &Transaction) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(tx.sender.as_bytes());
    hasher.update(tx.nonce.to_be_bytes());
    hasher.update(tx.gas_price.to_be_bytes());
    hasher.update(tx.receiver.as_bytes());
    hasher.update(&tx.data);
    hex::encode(hasher.finalize())
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    async fn get_account(&self, address: &Address) -> RelayerResult<Account> {
        let mut state = self.lock();
        state.account_queries += 1;
        if state.unavailable.contains(address) {
            return Err(RelayerError::Gateway(format!(
                "account {} unavailable",
                address
            )));
        }
        let nonce = state.accounts.get(address).map(|a| a.nonce).unwrap_or(0);
        Ok(Account {
            address: address.clone(),
            nonce,
            balance: u128::MAX,
        })
    }

    async fn send_transaction(&self, tx: &Transaction) -> RelayerResult<String> {
        self.submit(tx)
    }

    async fn send_transactions(&self, txs: &[Transaction]) -> RelayerResult<Vec<String>> {
        let mut hashes = Vec::with_capacity(txs.len());
        for tx in txs {
            match self.submit(tx) {
                Ok(hash) => hashes.push(hash),
                Err(e) => debug!("Simulated ledger rejected nonce {} in batch: {}", tx.nonce, e),
            }
        }
        Ok(hashes)
    }

    async fn get_network_config(&self) -> RelayerResult<NetworkConfig> {
        Ok(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(sender: &Address, nonce: u64, gas_price: u64) -> Transaction {
        Transaction {
            nonce,
            sender: sender.clone(),
            receiver: Address::from(vec![0x02; 32]),
            gas_price,
            gas_limit: 50_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_executes_in_nonce_order() {
        let ledger = SimulatedLedger::new("T", 10);
        let alice = Address::from(vec![0x01; 32]);

        ledger.send_transaction(&tx(&alice, 1, 10)).await.unwrap();
        assert_eq!(ledger.nonce_of(&alice), 0);
        assert_eq!(ledger.mempool_nonces(&alice), vec![1]);

        ledger.send_transaction(&tx(&alice, 0, 10)).await.unwrap();
        assert_eq!(ledger.nonce_of(&alice), 2);
        assert!(ledger.mempool_nonces(&alice).is_empty());
        assert_eq!(ledger.submitted_nonces(&alice), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_rejects_low_nonce_and_gas() {
        let ledger = SimulatedLedger::new("T", 10);
        let alice = Address::from(vec![0x01; 32]);
        ledger.set_nonce(&alice, 5);

        let err = ledger.send_transaction(&tx(&alice, 4, 10)).await.unwrap_err();
        assert!(err.to_string().contains("nonce too low"));

        let err = ledger.send_transaction(&tx(&alice, 5, 9)).await.unwrap_err();
        assert!(err.to_string().contains("insufficient gas price"));
    }

    #[tokio::test]
    async fn test_replacement_requires_higher_gas_price() {
        let ledger = SimulatedLedger::new("T", 10);
        let alice = Address::from(vec![0x01; 32]);

        ledger.send_transaction(&tx(&alice, 3, 10)).await.unwrap();
        // Identical resend is accepted as already known
        ledger.send_transaction(&tx(&alice, 3, 10)).await.unwrap();

        let mut other = tx(&alice, 3, 10);
        other.data = b"other".to_vec();
        let err = ledger.send_transaction(&other).await.unwrap_err();
        assert!(err.to_string().contains("underpriced"));

        other.gas_price = 11;
        ledger.send_transaction(&other).await.unwrap();
        assert_eq!(ledger.mempool_nonces(&alice), vec![3]);
    }

    #[tokio::test]
    async fn test_drop_every_loses_submissions() {
        let ledger = SimulatedLedger::new("T", 10).with_drop_every(2);
        let alice = Address::from(vec![0x01; 32]);

        ledger.send_transaction(&tx(&alice, 0, 10)).await.unwrap();
        ledger.send_transaction(&tx(&alice, 1, 10)).await.unwrap(); // lost
        ledger.send_transaction(&tx(&alice, 2, 10)).await.unwrap();

        assert_eq!(ledger.nonce_of(&alice), 1);
        assert_eq!(ledger.mempool_nonces(&alice), vec![2]);
    }

    #[tokio::test]
    async fn test_unavailable_account() {
        let ledger = SimulatedLedger::new("T", 10);
        let alice = Address::from(vec![0x01; 32]);
        ledger.set_unavailable(&alice, true);

        assert!(ledger.get_account(&alice).await.is_err());
        assert!(ledger.send_transaction(&tx(&alice, 0, 10)).await.is_err());

        ledger.set_unavailable(&alice, false);
        assert_eq!(ledger.get_account(&alice).await.unwrap().nonce, 0);
    }
}
