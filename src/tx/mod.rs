//! Nonce allocation, ordered submission and resend of stuck transactions

mod events;
mod gas;
mod handler;
mod nonce;
mod sender;
mod types;

pub use events::{EventSink, NonceEvent};
pub use gas::{GasPriceFloor, GAS_PRICE_INCREMENT};
pub use handler::{
    NonceHandlerBuilder, NonceTransactionsHandler, DEFAULT_RESEND_INTERVAL,
    DEFAULT_SEND_INTERVAL, MIN_RESEND_INTERVAL,
};
pub use nonce::{AddressNonceHandler, NonceSnapshot, GAP_MARGIN};
pub use sender::{SendResult, TransactionWorker};
pub use types::{Address, Fingerprint, Transaction};
