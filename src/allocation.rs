//! Proportional split of the distributable pool.
//!
//! Shares are computed in integer arithmetic: each holder's points are
//! quantized to a fraction of 2^63, and payouts are `floor(pool * q / Σq)`.
//! Flooring every term keeps `Σ payout <= pool`; the truncated remainder
//! stays with the distributor.

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tracing::info;

use crate::weights::ScoredHolder;

/// Quantization range for points. Small enough that `u64::MAX * q` fits
/// in a `u128`.
const SHARE_SCALE: f64 = 9_223_372_036_854_775_808.0; // 2^63

/// What the run may hand out, or `None` when the balance is too small to
/// bother.
pub fn distributable_pool(balance: u64, reserve: u64, minimum: u64) -> Option<u64> {
    if balance <= minimum {
        return None;
    }
    let pool = balance.saturating_sub(reserve);
    (pool > 0).then_some(pool)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedHolder {
    pub owner: Pubkey,
    pub raw_amount: u64,
    pub bonus_amount: u64,
    pub multiplier: f64,
    pub points: f64,
    /// `points / Σpoints`, for reporting only.
    pub share_fraction: f64,
    /// Base units of the distribution token.
    pub payout: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AllocationReport {
    pub pool: u64,
    pub total_points: f64,
    /// Holders that receive a transfer, in scoring order.
    pub allocated: Vec<AllocatedHolder>,
    /// Holders whose points or payout fell under the dust cutoff.
    pub below_cutoff: Vec<AllocatedHolder>,
}

impl AllocationReport {
    pub fn total_payout(&self) -> u64 {
        self.allocated.iter().map(|h| h.payout).sum()
    }

    /// Pool left undistributed by truncation and dust exclusion.
    pub fn remainder(&self) -> u64 {
        self.pool.saturating_sub(self.total_payout())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DustPolicy {
    pub min_points: f64,
    /// Payouts under this many base units are skipped. Zero payouts are
    /// always skipped.
    pub min_payout: u64,
}

impl DustPolicy {
    fn admits(&self, holder: &AllocatedHolder) -> bool {
        holder.payout > 0 && holder.payout >= self.min_payout && holder.points >= self.min_points
    }
}

pub fn allocate(scored: Vec<ScoredHolder>, pool: u64, dust: DustPolicy) -> AllocationReport {
    let total_points: f64 = scored.iter().map(|h| h.points).sum();
    let mut report = AllocationReport {
        pool,
        total_points,
        ..Default::default()
    };

    if pool == 0 || !total_points.is_finite() || total_points <= 0.0 {
        info!(pool, total_points, "nothing to allocate");
        report.below_cutoff = scored
            .into_iter()
            .map(|h| into_allocated(h, 0.0, 0))
            .collect();
        return report;
    }

    let quantized: Vec<u128> = scored
        .iter()
        .map(|h| {
            if h.points.is_finite() && h.points > 0.0 {
                ((h.points / total_points) * SHARE_SCALE).floor() as u128
            } else {
                0
            }
        })
        .collect();
    let quantized_total: u128 = quantized.iter().sum();

    for (holder, q) in scored.into_iter().zip(quantized) {
        let payout = if quantized_total == 0 {
            0
        } else {
            // q <= quantized_total, so the quotient is at most `pool`
            (pool as u128 * q / quantized_total) as u64
        };
        let share = holder.points / total_points;
        let allocated = into_allocated(holder, share, payout);
        if dust.admits(&allocated) {
            report.allocated.push(allocated);
        } else {
            report.below_cutoff.push(allocated);
        }
    }

    info!(
        pool,
        recipients = report.allocated.len(),
        below_cutoff = report.below_cutoff.len(),
        total_payout = report.total_payout(),
        remainder = report.remainder(),
        "pool allocated"
    );
    report
}

fn into_allocated(holder: ScoredHolder, share_fraction: f64, payout: u64) -> AllocatedHolder {
    AllocatedHolder {
        owner: holder.owner,
        raw_amount: holder.raw_amount,
        bonus_amount: holder.bonus_amount,
        multiplier: holder.multiplier,
        points: holder.points,
        share_fraction,
        payout,
    }
}
