//! Distribution tunables.
//!
//! Every batching, retry and eligibility constant lives in one immutable
//! [`DistributionConfig`] that is handed to the engine at construction. Values
//! can come from a TOML file; anything omitted falls back to the defaults
//! below.

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::{collections::HashSet, fs, path::Path, str::FromStr, time::Duration};

use crate::error::{DistributionError, DistributionResult};

/// Hard ceiling on transfers per transaction. Each transfer may carry an
/// account-creation instruction, and past this the legacy message no longer
/// fits a packet.
pub const MAX_TRANSFERS_PER_TX: usize = 10;

/// AMM / DEX programs whose vaults must never receive a holder reward.
pub const DEFAULT_POOL_PROGRAMS: &[&str] = &[
    "CPMMoo8L3F4NbTegBCKVNunggL7H1ZpdTHKxQB5qKP1C", // Raydium CPMM
    "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", // Raydium AMM v4
    "HyaB3W9q6XdA5xwpU4XnSZV94htfmbmqJXZcEbRaJutt", // Orca Whirlpool
    "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc",  // Orca Whirlpool
    "CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", // Kamino
    "DjVE6JNiYqPL2QXyCUUh8rNjHrbz9hXHNYt99MQ59qw1", // Meteora DLMM
    "7Y9wjvR8nGmj4nPVSPBR2FJYCVdcNjLpLLNPH1dEjCRr", // Meteora DAMM v1
    "Eo7WjKq67rjJQSZxS6z3YkapzY3eMj6Xy8X5EQVn5UaB", // Meteora DAMM v2
    "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4",  // Jupiter v6
    "JUP4Fb2cqiRUcaTHdrPC8h2gNsA2ETXiPDD33WcGuJB",  // Jupiter v4
    "dynMpX7j1Ry59x4ePmWdDYQsxSPsUqUkphJwJxtF6zP",  // Meteora DBC
];

pub const DEFAULT_BLACKLIST: &[&str] = &["HLnpSz9h2S4hiLQ43rnSD9XkcUThA7B8hQMKmDaiTLcC"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Recipients per transaction.
    pub transfers_per_tx: usize,
    /// Batches in flight at once.
    pub concurrency: usize,
    /// Submission attempts per batch, including the first.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Upper bound on a single submit-and-confirm attempt.
    pub submit_timeout_ms: u64,
    /// Submissions per second across all workers; 0 disables the limiter.
    pub rate_limit: u32,

    /// Holders looked up concurrently per group.
    pub lookup_group_size: usize,
    pub lookup_group_delay_ms: u64,

    /// `points = (raw * holding_weight + bonus * bonus_weight) * multiplier`
    pub holding_weight: f64,
    pub bonus_weight: f64,

    /// Holders below either cutoff get nothing but stay in the report.
    pub min_points: f64,
    pub min_payout: u64,

    /// The run is skipped unless the source balance exceeds this.
    pub min_distribution_amount: u64,
    pub reserve_amount: u64,

    /// Compute unit price in micro-lamports.
    pub priority_fee: u64,

    pub pool_programs: Vec<String>,
    pub blacklist: Vec<String>,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            transfers_per_tx: 3,
            concurrency: 6,
            max_attempts: 3,
            retry_backoff_ms: 2_000,
            submit_timeout_ms: 90_000,
            rate_limit: 10,
            lookup_group_size: 50,
            lookup_group_delay_ms: 100,
            holding_weight: 1.0,
            bonus_weight: 2.0,
            min_points: 0.0,
            min_payout: 10,
            min_distribution_amount: 300_000,
            reserve_amount: 0,
            priority_fee: 1_000,
            pool_programs: DEFAULT_POOL_PROGRAMS.iter().map(|s| s.to_string()).collect(),
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DistributionConfig {
    /// Read a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> DistributionResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            DistributionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            DistributionError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DistributionResult<()> {
        if self.transfers_per_tx == 0 || self.transfers_per_tx > MAX_TRANSFERS_PER_TX {
            return Err(DistributionError::Config(format!(
                "transfers_per_tx must be between 1 and {}, got {}",
                MAX_TRANSFERS_PER_TX, self.transfers_per_tx
            )));
        }
        if self.concurrency == 0 {
            return Err(DistributionError::Config("concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(DistributionError::Config("max_attempts must be at least 1".into()));
        }
        if self.lookup_group_size == 0 {
            return Err(DistributionError::Config(
                "lookup_group_size must be at least 1".into(),
            ));
        }
        for (name, weight) in [
            ("holding_weight", self.holding_weight),
            ("bonus_weight", self.bonus_weight),
            ("min_points", self.min_points),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(DistributionError::Config(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, weight
                )));
            }
        }
        self.pool_program_set()?;
        self.blacklist_set()?;
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn lookup_group_delay(&self) -> Duration {
        Duration::from_millis(self.lookup_group_delay_ms)
    }

    pub fn pool_program_set(&self) -> DistributionResult<HashSet<Pubkey>> {
        parse_key_set("pool_programs", &self.pool_programs)
    }

    pub fn blacklist_set(&self) -> DistributionResult<HashSet<Pubkey>> {
        parse_key_set("blacklist", &self.blacklist)
    }
}

fn parse_key_set(field: &str, keys: &[String]) -> DistributionResult<HashSet<Pubkey>> {
    keys.iter()
        .map(|k| {
            Pubkey::from_str(k).map_err(|e| {
                DistributionError::Config(format!("{} entry {} is not a valid address: {}", field, k, e))
            })
        })
        .collect()
}
