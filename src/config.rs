//! Configuration management for the nonce relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tx::MIN_RESEND_INTERVAL;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub nonce_handler: NonceHandlerConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NonceHandlerConfig {
    pub resend_interval_secs: u64,
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Load generator run by the binary against the in-memory ledger
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub chain_id: String,
    pub accounts: usize,
    pub senders_per_account: usize,
    pub transactions_per_sender: usize,
    pub min_gas_price: u64,
    /// Lose every n-th accepted submission, 0 disables
    pub drop_every: u64,
    /// How long to wait for every account to settle after the load
    pub settle_timeout_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            chain_id: "local".to_string(),
            accounts: 3,
            senders_per_account: 4,
            transactions_per_sender: 25,
            min_gas_price: 1_000_000_000,
            drop_every: 0,
            settle_timeout_secs: 120,
        }
    }
}

fn default_send_interval_ms() -> u64 {
    50
}

impl Settings {
    /// Load settings from the file named by `NONCE_RELAYER_CONFIG`, or
    /// `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("NONCE_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.nonce_handler.resend_interval() < MIN_RESEND_INTERVAL {
            anyhow::bail!(
                "nonce_handler.resend_interval_secs must be at least {}",
                MIN_RESEND_INTERVAL.as_secs()
            );
        }
        if self.nonce_handler.send_interval_ms == 0 {
            anyhow::bail!("nonce_handler.send_interval_ms must be positive");
        }
        if self.simulation.accounts == 0 || self.simulation.senders_per_account == 0 {
            anyhow::bail!("simulation needs at least one account and one sender");
        }
        if self.simulation.min_gas_price == 0 {
            tracing::warn!("Simulation minimum gas price is zero");
        }

        Ok(())
    }
}

impl NonceHandlerConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }
}

impl SimulationConfig {
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
