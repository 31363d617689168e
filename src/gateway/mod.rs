//! Remote ledger gateway abstraction
//!
//! The nonce handlers only need four calls from a node/gateway. Real HTTP
//! clients live outside this crate; `SimulatedLedger` is an in-memory
//! implementation used by the soak binary and the tests.

pub mod simulated;

pub use simulated::SimulatedLedger;

use crate::error::RelayerResult;
use crate::tx::{Address, Transaction};

use async_trait::async_trait;

/// Account state as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub address: Address,
    /// Next nonce the network expects from this account
    pub nonce: u64,
    pub balance: u128,
}

/// Network parameters relevant to transaction pricing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub chain_id: String,
    pub min_gas_price: u64,
    pub min_gas_limit: u64,
}

/// Calls consumed from the remote ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Fetch the account, including the nonce the chain currently expects
    async fn get_account(&self, address: &Address) -> RelayerResult<Account>;

    /// Submit one transaction, returning its hash
    async fn send_transaction(&self, tx: &Transaction) -> RelayerResult<String>;

    /// Submit a batch, returning one hash per accepted transaction
    async fn send_transactions(&self, txs: &[Transaction]) -> RelayerResult<Vec<String>>;

    /// Fetch the network configuration (minimum gas price)
    async fn get_network_config(&self) -> RelayerResult<NetworkConfig>;
}
