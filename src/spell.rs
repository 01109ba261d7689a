//! Bonus state read from the spell program.
//!
//! Each wallet may own a `UserState` PDA (`["user", owner]`) recording runes
//! crafted from burned tokens and the expiry of each spell tier's buff. Runes
//! become the bonus amount; active buffs and rune holdings become the
//! multiplier.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{commitment_config::CommitmentConfig, hash::hash, pubkey::Pubkey};
use std::sync::Arc;
use tracing::debug;

use crate::{
    error::{DistributionError, DistributionResult},
    weights::{BonusState, BonusStateLookup},
};

pub const USER_STATE_SEED: &[u8] = b"user";
pub const RUNE_DECIMALS: i32 = 6;

/// Multiplier added by each tier while its buff is live: novice, adept,
/// master, legendary.
pub const TIER_BOOSTS: [f64; 4] = [0.10, 0.25, 0.50, 1.00];

/// 1% per 10,000 whole runes, capped.
const RUNES_PER_PERCENT: f64 = 10_000.0;
const MAX_RUNE_BONUS: f64 = 0.20;

const DISCRIMINATOR_LEN: usize = 8;
const RUNES_OFFSET: usize = DISCRIMINATOR_LEN + 32;
const MULTIPLIER_OFFSET: usize = RUNES_OFFSET + 8 + 4 * 8;
const BUFF_EXPIRY_OFFSET: usize = MULTIPLIER_OFFSET + 8;
const ACTIVE_TIER_OFFSET: usize = BUFF_EXPIRY_OFFSET + 8;
const TIER_EXPIRY_OFFSET: usize = ACTIVE_TIER_OFFSET + 1;
/// Accounts created before per-tier expiries existed end here.
const LEGACY_MIN_LEN: usize = TIER_EXPIRY_OFFSET;
const CURRENT_MIN_LEN: usize = TIER_EXPIRY_OFFSET + 4 * 8;

/// Handle on the deployed spell program, resolved once per process and
/// shared by every lookup of a run.
#[derive(Debug, Clone)]
pub struct SpellProgram {
    program_id: Pubkey,
    user_state_discriminator: [u8; 8],
}

impl SpellProgram {
    pub fn new(program_id: Pubkey) -> Self {
        let mut user_state_discriminator = [0u8; 8];
        user_state_discriminator.copy_from_slice(&hash(b"account:UserState").to_bytes()[..8]);
        Self {
            program_id,
            user_state_discriminator,
        }
    }

    /// Confirms the program is deployed before any holder is scored.
    pub async fn load(client: &RpcClient, program_id: Pubkey) -> DistributionResult<Self> {
        let account = client
            .get_account(&program_id)
            .await
            .map_err(|e| DistributionError::Rpc(format!("spell program {}: {}", program_id, e)))?;
        if !account.executable {
            return Err(DistributionError::Config(format!(
                "spell program {} is not an executable account",
                program_id
            )));
        }
        Ok(Self::new(program_id))
    }

    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    pub fn user_state_address(&self, owner: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(&[USER_STATE_SEED, owner.as_ref()], &self.program_id).0
    }

    pub fn decode_user_state(&self, data: &[u8]) -> Option<UserState> {
        if data.len() < LEGACY_MIN_LEN || data[..DISCRIMINATOR_LEN] != self.user_state_discriminator {
            return None;
        }
        let tier_expiries = if data.len() >= CURRENT_MIN_LEN {
            let mut expiries = [0i64; 4];
            for (i, expiry) in expiries.iter_mut().enumerate() {
                *expiry = read_i64(data, TIER_EXPIRY_OFFSET + i * 8)?;
            }
            Some(expiries)
        } else {
            None
        };
        Some(UserState {
            runes: read_u64(data, RUNES_OFFSET)?,
            legacy_multiplier: f64::from_le_bytes(data.get(MULTIPLIER_OFFSET..MULTIPLIER_OFFSET + 8)?.try_into().ok()?),
            legacy_buff_expiry: read_i64(data, BUFF_EXPIRY_OFFSET)?,
            tier_expiries,
        })
    }
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(offset..offset + 8)?.try_into().ok()?))
}

fn read_i64(data: &[u8], offset: usize) -> Option<i64> {
    Some(i64::from_le_bytes(data.get(offset..offset + 8)?.try_into().ok()?))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserState {
    pub runes: u64,
    pub legacy_multiplier: f64,
    pub legacy_buff_expiry: i64,
    /// `None` for accounts still in the pre-migration layout.
    pub tier_expiries: Option<[i64; 4]>,
}

impl UserState {
    pub fn rune_bonus(&self) -> f64 {
        let whole_runes = self.runes as f64 / 10f64.powi(RUNE_DECIMALS);
        (whole_runes / RUNES_PER_PERCENT * 0.01).min(MAX_RUNE_BONUS)
    }

    pub fn spell_multiplier(&self, now: i64) -> f64 {
        let tier_boost: f64 = self
            .tier_expiries
            .map(|expiries| {
                expiries
                    .iter()
                    .zip(TIER_BOOSTS)
                    .filter(|(expiry, _)| **expiry > now)
                    .map(|(_, boost)| boost)
                    .sum()
            })
            .unwrap_or(0.0);

        if tier_boost > 0.0 {
            1.0 + tier_boost
        } else if self.legacy_buff_expiry > now && self.legacy_multiplier.is_finite() {
            self.legacy_multiplier.max(1.0)
        } else {
            1.0
        }
    }

    pub fn bonus_state(&self, now: i64) -> BonusState {
        BonusState {
            bonus_amount: self.runes,
            multiplier: self.spell_multiplier(now) + self.rune_bonus(),
        }
    }
}

pub struct SpellBonusLookup {
    client: Arc<RpcClient>,
    program: Arc<SpellProgram>,
    /// Buff expiry is judged against one clock reading for the whole run.
    now: i64,
}

impl SpellBonusLookup {
    pub fn new(client: Arc<RpcClient>, program: Arc<SpellProgram>, now: i64) -> Self {
        Self {
            client,
            program,
            now,
        }
    }
}

#[async_trait]
impl BonusStateLookup for SpellBonusLookup {
    async fn fetch(&self, owner: &Pubkey) -> DistributionResult<Option<BonusState>> {
        let address = self.program.user_state_address(owner);
        let response = self
            .client
            .get_account_with_commitment(&address, CommitmentConfig::confirmed())
            .await
            .map_err(|e| DistributionError::Rpc(e.to_string()))?;

        let Some(account) = response.value else {
            return Ok(None);
        };
        if account.owner != *self.program.program_id() {
            debug!(%owner, %address, "user state owned by another program");
            return Ok(None);
        }
        match self.program.decode_user_state(&account.data) {
            Some(state) => Ok(Some(state.bonus_state(self.now))),
            None => {
                debug!(%owner, %address, "user state failed to decode");
                Ok(None)
            }
        }
    }
}
