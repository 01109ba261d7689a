//! Cumulative distribution history.
//!
//! The history is append-only: each completed run adds one record and bumps
//! the all-time total by what actually landed. It is written once, as the
//! last step of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{error, info};

use crate::{
    dispatch::{BatchOutcome, DispatchReport},
    error::{DistributionError, DistributionResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: usize,
    pub recipients: Vec<String>,
    pub amount: u64,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRun {
    pub timestamp: DateTime<Utc>,
    pub snapshot_mint: String,
    pub distribution_mint: String,
    /// Sum of payouts handed to the dispatcher.
    pub allocated_amount: u64,
    /// Sum of payouts in Confirmed batches only.
    pub total_amount_distributed: u64,
    pub recipient_count: usize,
    pub failed_recipient_count: usize,
    pub batch_results: Vec<BatchRecord>,
}

impl DistributionRun {
    pub fn from_report(snapshot_mint: &Pubkey, distribution_mint: &Pubkey, report: &DispatchReport) -> Self {
        let batch_results: Vec<BatchRecord> = report
            .results
            .iter()
            .map(|r| BatchRecord {
                batch_id: r.batch_id,
                recipients: r.recipients.iter().map(ToString::to_string).collect(),
                amount: r.amount,
                outcome: r.outcome.clone(),
            })
            .collect();
        let failed_recipient_count = report.failed().map(|r| r.recipients.len()).sum();
        let recipient_count = report.confirmed().map(|r| r.recipients.len()).sum();

        Self {
            timestamp: Utc::now(),
            snapshot_mint: snapshot_mint.to_string(),
            distribution_mint: distribution_mint.to_string(),
            allocated_amount: report.results.iter().map(|r| r.amount).sum(),
            total_amount_distributed: report.confirmed_amount(),
            recipient_count,
            failed_recipient_count,
            batch_results,
        }
    }

    pub fn confirmed_batches(&self) -> usize {
        self.batch_results.iter().filter(|b| b.outcome.is_confirmed()).count()
    }

    pub fn signatures(&self) -> Vec<&str> {
        self.batch_results.iter().filter_map(|b| b.outcome.signature()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionHistory {
    pub total_distributed_all_time: u64,
    pub runs: Vec<DistributionRun>,
}

impl DistributionHistory {
    pub fn append(&mut self, run: DistributionRun) {
        self.total_distributed_all_time = self
            .total_distributed_all_time
            .saturating_add(run.total_amount_distributed);
        self.runs.push(run);
    }
}

pub trait HistoryStore: Send + Sync {
    /// An absent history is empty, not an error.
    fn load(&self) -> DistributionResult<DistributionHistory>;
    fn save(&self, history: &DistributionHistory) -> DistributionResult<()>;
}

/// Pretty-printed JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonHistoryStore {
    path: PathBuf,
}

impl JsonHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonHistoryStore {
    fn load(&self) -> DistributionResult<DistributionHistory> {
        if !self.path.exists() {
            return Ok(DistributionHistory::default());
        }
        let data = fs::read_to_string(&self.path)
            .map_err(|e| DistributionError::HistoryLoad(format!("{}: {}", self.path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| DistributionError::HistoryLoad(format!("{}: {}", self.path.display(), e)))
    }

    fn save(&self, history: &DistributionHistory) -> DistributionResult<()> {
        let persist = DistributionError::HistoryWrite;
        let data = serde_json::to_string_pretty(history).map_err(|e| persist(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|e| persist(format!("{}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path).map_err(|e| persist(format!("{}: {}", self.path.display(), e)))
    }
}

/// Commits a finished run. Must be the last step of the run.
pub struct LedgerRecorder<'a> {
    store: &'a dyn HistoryStore,
}

impl<'a> LedgerRecorder<'a> {
    pub fn new(store: &'a dyn HistoryStore) -> Self {
        Self { store }
    }

    /// On failure the run comes back inside [`DistributionError::HistoryPersist`]
    /// so its signatures are not lost. Nothing is retried.
    pub fn record(&self, run: DistributionRun) -> DistributionResult<DistributionHistory> {
        let mut history = match self.store.load() {
            Ok(history) => history,
            Err(e) => return Err(persist_failure(run, e)),
        };
        history.append(run);

        if let Err(e) = self.store.save(&history) {
            return Err(match history.runs.pop() {
                Some(run) => persist_failure(run, e),
                None => e,
            });
        }

        if let Some(run) = history.runs.last() {
            info!(
                distributed = run.total_amount_distributed,
                recipients = run.recipient_count,
                failed_recipients = run.failed_recipient_count,
                all_time = history.total_distributed_all_time,
                "distribution history updated"
            );
        }
        Ok(history)
    }
}

fn persist_failure(run: DistributionRun, cause: DistributionError) -> DistributionError {
    error!(
        confirmed_batches = run.confirmed_batches(),
        error = %cause,
        "history not saved after transfers landed"
    );
    DistributionError::HistoryPersist {
        run: Box::new(run),
        message: cause.to_string(),
    }
}
