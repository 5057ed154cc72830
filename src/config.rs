//! Configuration for the transaction core, the in-memory provider and the
//! workload simulator.
//!
//! All sections can be loaded from a single JSON file; missing fields fall
//! back to their defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReplError, Result};

/// Configuration for [`TransactionContext`](crate::transaction::TransactionContext)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Maximum number of state history entries kept for diagnostics
    /// (0 = unbounded). Older entries are discarded first.
    pub state_history_limit: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            state_history_limit: 64,
        }
    }
}

impl TransactionConfig {
    /// Keep the full state history (useful in tests)
    pub fn unbounded_history() -> Self {
        Self {
            state_history_limit: 0,
        }
    }
}

/// Configuration for [`InMemoryProvider`](crate::provider::InMemoryProvider)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Identity of this node in global transaction ids
    pub source_id: u64,
    /// How long a write-set may wait for its turn in commit order
    /// before the provider reports a node failure (milliseconds)
    pub commit_order_timeout_ms: u64,
    /// Maximum write-set size in bytes (0 = unlimited)
    pub max_write_set_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            source_id: 1,
            commit_order_timeout_ms: 10_000,
            max_write_set_bytes: 0,
        }
    }
}

/// Configuration for the workload simulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of concurrent client sessions
    pub clients: usize,
    /// Transactions each client runs
    pub transactions_per_client: usize,
    /// Exclusive keys appended per transaction
    pub keys_per_transaction: usize,
    /// Number of distinct keys (smaller = more conflicts)
    pub key_space: u64,
    /// Probability that the injector BF-aborts a client on each tick
    pub bf_abort_probability: f64,
    /// RNG seed for reproducible runs
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            clients: 4,
            transactions_per_client: 200,
            keys_per_transaction: 2,
            key_space: 1_000,
            bf_abort_probability: 0.05,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    /// Small key space and frequent BF-aborts
    pub fn high_contention() -> Self {
        Self {
            key_space: 16,
            bf_abort_probability: 0.25,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.clients == 0 {
            return Err(ReplError::Config("clients must be at least 1".into()));
        }
        if self.key_space == 0 {
            return Err(ReplError::Config("key_space must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.bf_abort_probability) {
            return Err(ReplError::Config(format!(
                "bf_abort_probability {} is not within [0, 1]",
                self.bf_abort_probability
            )));
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transaction: TransactionConfig,
    pub provider: ProviderConfig,
    pub simulation: SimulationConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        config.simulation.validate()?;
        Ok(config)
    }
}
