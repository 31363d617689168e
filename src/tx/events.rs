//! Diagnostics emitted by the nonce handlers
//!
//! Events go to an injected channel rather than a global logger so callers
//! (and tests) can observe what happened to each account.

use super::types::Address;

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceEvent {
    /// A nonce and gas price were written into a transaction
    NonceApplied {
        address: Address,
        nonce: u64,
        gas_price: u64,
    },
    /// The chain is behind the lowest nonce we still consider outstanding
    GapDetected {
        address: Address,
        chain_nonce: u64,
        lowest_nonce: u64,
    },
    /// An identical transaction is already pending
    DuplicateRejected { address: Address, nonce: u64 },
    /// The submission queue handed a transaction to the gateway
    TransactionSent {
        address: Address,
        nonce: u64,
        hash: String,
    },
    TransactionSendFailed {
        address: Address,
        nonce: u64,
        error: String,
    },
    /// Outstanding transactions were resent by the reconciliation loop
    TransactionsResent {
        address: Address,
        nonces: Vec<u64>,
        hashes: Vec<String>,
    },
    /// Every pending transaction is confirmed
    TransactionsConfirmed { address: Address, chain_nonce: u64 },
    /// Pending transactions were discarded and the gas floor raised
    TransactionsDropped { address: Address, gas_price: u64 },
    ReconciliationFailed { address: Address, error: String },
}

/// Cheap, cloneable handle for emitting `NonceEvent`s. A sink without a
/// receiver discards everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<NonceEvent>>,
}

impl EventSink {
    pub fn new(sender: mpsc::UnboundedSender<NonceEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NonceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: NonceEvent) {
        if let Some(sender) = &self.sender {
            // Receiver gone: nobody is listening anymore
            let _ = sender.send(event);
        }
    }
}
