//! Nonce Relayer - per-account nonce allocation and transaction submission
//!
//! Many callers can request nonces and send transactions for the same
//! account concurrently. Nonces come out unique and contiguous, transactions
//! reach the network in nonce order, and a background loop resends anything
//! the chain has not confirmed yet.

pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod simulation;
pub mod tx;

pub use error::{RelayerError, RelayerResult};
pub use gateway::{Account, LedgerGateway, NetworkConfig, SimulatedLedger};
pub use tx::{
    Address, AddressNonceHandler, EventSink, NonceEvent, NonceHandlerBuilder, NonceSnapshot,
    NonceTransactionsHandler, Transaction,
};
