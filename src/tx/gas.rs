//! Gas price floor tracking for one account

use super::types::Transaction;

/// Amount the floor is raised by on every drop
pub const GAS_PRICE_INCREMENT: u64 = 1;

/// Cached minimum gas price plus the escalation window opened by drops.
///
/// The floor starts empty and is fetched from the network on first use.
/// `escalate` raises it above whatever is stuck in the network's pool; the
/// raised value covers every nonce up to the highest one assigned before the
/// drop, after which the network minimum is fetched again.
#[derive(Debug, Clone, Default)]
pub struct GasPriceFloor {
    price: Option<u64>,
    escalated_until: Option<u64>,
}

impl GasPriceFloor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<u64> {
        self.price
    }

    /// Whether assigning `nonce` requires a fresh network minimum first
    pub fn needs_refresh(&self, nonce: u64) -> bool {
        match (self.price, self.escalated_until) {
            (None, _) => true,
            (Some(_), Some(until)) => nonce > until,
            (Some(_), None) => false,
        }
    }

    /// Store a freshly fetched network minimum, closing any escalation window
    pub fn refresh(&mut self, network_min: u64) {
        self.price = Some(network_min);
        self.escalated_until = None;
    }

    /// Raise the floor by one increment. `last_assigned` is the highest nonce
    /// handed out so far; the raised floor stays in force up to it.
    pub fn escalate(&mut self, network_min: u64, last_assigned: Option<u64>) -> u64 {
        let base = self.price.map_or(network_min, |p| p.max(network_min));
        let raised = base.saturating_add(GAS_PRICE_INCREMENT);
        self.price = Some(raised);
        if let Some(nonce) = last_assigned {
            self.escalated_until = Some(self.escalated_until.map_or(nonce, |u| u.max(nonce)));
        }
        raised
    }

    /// Raise the transaction's gas price to the floor if it is lower
    pub fn apply(&self, tx: &mut Transaction) {
        if let Some(price) = self.price {
            tx.gas_price = tx.gas_price.max(price);
        }
    }
}
