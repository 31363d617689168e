//! Account and transaction types shared by the nonce handlers and gateways

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Opaque account identity. Compared and hashed byte-wise, never mutated.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(Vec<u8>);

impl Address {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Address {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Address {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<[u8; 32]> for Address {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Key identifying the same logical transfer across resubmissions
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

/// A transaction draft. Nonce and gas price are filled in by the nonce
/// handler; signing happens outside this crate, after they are applied.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub value: u128,
    pub receiver: Address,
    pub sender: Address,
    pub gas_price: u64,
    pub gas_limit: u64,
    #[serde(default)]
    pub data: Vec<u8>,
    pub chain_id: String,
    pub version: u32,
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Keccak-256 over receiver, payload and value. Nonce, gas and signature
    /// are excluded: a re-priced resubmission must still match.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Keccak256::new();
        hasher.update((self.receiver.as_bytes().len() as u64).to_be_bytes());
        hasher.update(self.receiver.as_bytes());
        hasher.update((self.data.len() as u64).to_be_bytes());
        hasher.update(&self.data);
        hasher.update(self.value.to_be_bytes());
        Fingerprint(hasher.finalize().into())
    }
}
