//! Weighted reward distribution to SPL token holders.
//!
//! A run takes a holder snapshot of one mint, scores each holder, splits a
//! pool of another mint proportionally, and pays it out in small batched
//! transactions sent by a bounded worker pool. Every run is recorded in an
//! append-only history file.

pub mod allocation;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod history;
pub mod recipients;
pub mod rpc;
pub mod snapshot;
pub mod spell;
pub mod weights;

pub use config::DistributionConfig;
pub use engine::{Collaborators, DistributionEngine, DistributionPlan, DistributionTarget, RunSummary};
pub use error::{DistributionError, DistributionResult, SubmitError};
