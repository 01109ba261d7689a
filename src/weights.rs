//! Points scoring: raw holdings plus an optional bonus signal, scaled by a
//! per-holder multiplier.

use async_trait::async_trait;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use solana_sdk::pubkey::Pubkey;
use std::{str::FromStr, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{config::DistributionConfig, error::DistributionResult, snapshot::HolderRecord};

/// Secondary signal attached to a holder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BonusState {
    pub bonus_amount: u64,
    pub multiplier: f64,
}

impl Default for BonusState {
    fn default() -> Self {
        Self {
            bonus_amount: 0,
            multiplier: 1.0,
        }
    }
}

#[async_trait]
pub trait BonusStateLookup: Send + Sync {
    /// `Ok(None)` when the holder has no bonus state at all.
    async fn fetch(&self, owner: &Pubkey) -> DistributionResult<Option<BonusState>>;
}

/// Lookup for runs that weight on holdings alone.
pub struct NoBonus;

#[async_trait]
impl BonusStateLookup for NoBonus {
    async fn fetch(&self, _owner: &Pubkey) -> DistributionResult<Option<BonusState>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub holding: f64,
    pub bonus: f64,
}

impl Weights {
    pub fn from_config(config: &DistributionConfig) -> Self {
        Self {
            holding: config.holding_weight,
            bonus: config.bonus_weight,
        }
    }

    pub fn points(&self, raw_amount: u64, bonus_amount: u64, multiplier: f64) -> f64 {
        (raw_amount as f64 * self.holding + bonus_amount as f64 * self.bonus) * multiplier
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHolder {
    pub owner: Pubkey,
    pub raw_amount: u64,
    pub bonus_amount: u64,
    pub multiplier: f64,
    pub points: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ScoringReport {
    /// Same order as the input holders.
    pub holders: Vec<ScoredHolder>,
    pub total_points: f64,
    /// Owners that are not valid addresses.
    pub malformed: usize,
    /// Lookups that errored and were scored with the neutral bonus.
    pub lookup_failures: usize,
    pub with_bonus: usize,
}

pub struct WeightCalculator<'a> {
    lookup: &'a dyn BonusStateLookup,
    weights: Weights,
    group_size: usize,
    group_delay: Duration,
    show_progress: bool,
}

impl<'a> WeightCalculator<'a> {
    pub fn new(lookup: &'a dyn BonusStateLookup, config: &DistributionConfig) -> Self {
        Self {
            lookup,
            weights: Weights::from_config(config),
            group_size: config.lookup_group_size.max(1),
            group_delay: config.lookup_group_delay(),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Groups only bound how many lookups are in flight; a holder's points
    /// depend on nothing but its own record and bonus state.
    pub async fn score(&self, holders: &[HolderRecord]) -> ScoringReport {
        let mut report = ScoringReport::default();

        let mut parsed = Vec::with_capacity(holders.len());
        for holder in holders {
            match Pubkey::from_str(&holder.owner) {
                Ok(owner) => parsed.push((owner, holder.amount)),
                Err(_) => {
                    warn!(owner = %holder.owner, "dropping holder with malformed address");
                    report.malformed += 1;
                }
            }
        }

        let pb = if self.show_progress {
            ProgressBar::new(parsed.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} Fetching bonus state")
        {
            pb.set_style(style);
        }

        let groups = parsed.chunks(self.group_size).count();
        for (group_idx, group) in parsed.chunks(self.group_size).enumerate() {
            let states = join_all(group.iter().map(|(owner, _)| self.lookup.fetch(owner))).await;

            for ((owner, raw_amount), state) in group.iter().zip(states) {
                let state = match state {
                    Ok(Some(state)) => {
                        report.with_bonus += 1;
                        state
                    }
                    Ok(None) => BonusState::default(),
                    Err(e) => {
                        debug!(%owner, error = %e, "bonus lookup failed, using neutral bonus");
                        report.lookup_failures += 1;
                        BonusState::default()
                    }
                };
                let multiplier = if state.multiplier.is_finite() && state.multiplier >= 1.0 {
                    state.multiplier
                } else {
                    1.0
                };
                report.holders.push(ScoredHolder {
                    owner: *owner,
                    raw_amount: *raw_amount,
                    bonus_amount: state.bonus_amount,
                    multiplier,
                    points: self.weights.points(*raw_amount, state.bonus_amount, multiplier),
                });
            }
            pb.inc(group.len() as u64);

            if group_idx + 1 < groups && !self.group_delay.is_zero() {
                sleep(self.group_delay).await;
            }
        }
        pb.finish_and_clear();

        report.total_points = report.holders.iter().map(|h| h.points).sum();
        if report.lookup_failures > 0 {
            warn!(failures = report.lookup_failures, "some bonus lookups failed");
        }
        info!(
            holders = report.holders.len(),
            with_bonus = report.with_bonus,
            malformed = report.malformed,
            total_points = report.total_points,
            "holders scored"
        );
        report
    }
}
