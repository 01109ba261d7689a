//! Drops recipients that cannot take a direct token transfer.
//!
//! Runs before any instruction is built: one off-curve owner inside a batch
//! would make the whole transaction fail.

use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::allocation::AllocatedHolder;

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: Vec<AllocatedHolder>,
    /// Program-derived addresses; they have no private key and cannot own a
    /// standard associated token account.
    pub off_curve: usize,
    /// Addresses that are never a sensible recipient (the distributor itself,
    /// the default key).
    pub excluded: usize,
}

impl ValidationReport {
    pub fn dropped(&self) -> usize {
        self.off_curve + self.excluded
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecipientValidator {
    excluded: HashSet<Pubkey>,
}

impl RecipientValidator {
    /// `excluded` is typically the distributor wallet and its source account.
    pub fn new(excluded: impl IntoIterator<Item = Pubkey>) -> Self {
        Self {
            excluded: excluded.into_iter().collect(),
        }
    }

    pub fn validate(&self, holders: Vec<AllocatedHolder>) -> ValidationReport {
        let mut report = ValidationReport::default();
        for holder in holders {
            if self.excluded.contains(&holder.owner) || holder.owner == Pubkey::default() {
                debug!(owner = %holder.owner, "excluded recipient skipped");
                report.excluded += 1;
            } else if !holder.owner.is_on_curve() {
                debug!(owner = %holder.owner, "off-curve recipient skipped");
                report.off_curve += 1;
            } else {
                report.valid.push(holder);
            }
        }
        info!(
            valid = report.valid.len(),
            off_curve = report.off_curve,
            excluded = report.excluded,
            "recipients validated"
        );
        report
    }
}
