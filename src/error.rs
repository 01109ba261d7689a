//! Error types for the distribution engine.

use thiserror::Error;

use crate::history::DistributionRun;

/// Run-level failures. Per-holder and per-batch problems never surface here;
/// they are absorbed into the run's counts.
#[derive(Error, Debug)]
pub enum DistributionError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no snapshot data returned for mint {0}")]
    NoSnapshotData(String),

    #[error("snapshot source {source_name} failed: {message}")]
    Snapshot { source_name: String, message: String },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("failed to build instruction: {0}")]
    Instruction(String),

    #[error("failed to load distribution history: {0}")]
    HistoryLoad(String),

    #[error("failed to write distribution history: {0}")]
    HistoryWrite(String),

    /// The run's transfers already landed; the record is handed back so the
    /// caller can surface the confirmed signatures.
    #[error("failed to persist distribution history after {} confirmed batches: {message}", .run.confirmed_batches())]
    HistoryPersist {
        run: Box<DistributionRun>,
        message: String,
    },
}

pub type DistributionResult<T> = Result<T, DistributionError>;

/// Failure of a single batch submission attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Network hiccups, rate limiting, expired blockhash, timeouts.
    #[error("transient submission failure: {0}")]
    Transient(String),

    /// The ledger refused the transaction; resubmitting cannot help.
    #[error("submission rejected: {0}")]
    Rejected(String),
}

impl SubmitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::Transient(_))
    }
}
