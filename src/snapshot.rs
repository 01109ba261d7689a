//! Holder snapshots: where they come from and who gets excluded.

use async_trait::async_trait;
use csv::Reader;
use serde::{Deserialize, Serialize};
use solana_account_decoder::UiAccountEncoding;
use solana_client::{
    nonblocking::rpc_client::RpcClient,
    rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig},
    rpc_filter::{Memcmp, RpcFilterType},
};
use solana_sdk::{commitment_config::CommitmentConfig, program_pack::Pack, pubkey::Pubkey};
use spl_token::state::Account as TokenAccount;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};
use tracing::{debug, info, warn};

use crate::error::{DistributionError, DistributionResult};

/// Token-2022 tags the byte after the base account layout with its account type.
const TOKEN_2022_ACCOUNT_TYPE_ACCOUNT: u8 = 2;

/// One token account's balance at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderRecord {
    /// Wallet that owns the token account. Kept as text until scoring so a
    /// malformed entry costs one holder, not the run.
    pub owner: String,
    pub amount: u64,
    /// Program that owns the token account itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<Pubkey>,
}

impl HolderRecord {
    pub fn new(owner: impl Into<String>, amount: u64) -> Self {
        Self {
            owner: owner.into(),
            amount,
            program: None,
        }
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, mint: &Pubkey) -> DistributionResult<Vec<HolderRecord>>;
}

/// Result of walking the fallback chain.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub source: String,
    pub records: Vec<HolderRecord>,
}

/// Ordered list of sources; the first one that returns any records wins.
pub struct SnapshotChain {
    sources: Vec<Box<dyn SnapshotSource>>,
}

impl SnapshotChain {
    pub fn new(sources: Vec<Box<dyn SnapshotSource>>) -> Self {
        Self { sources }
    }

    /// Token-2022 first, then the classic token program.
    pub fn token_programs(client: Arc<RpcClient>) -> Self {
        Self::new(vec![
            Box::new(ProgramAccountsSource::token_2022(client.clone())),
            Box::new(ProgramAccountsSource::spl_token(client)),
        ])
    }

    pub async fn fetch(&self, mint: &Pubkey) -> DistributionResult<Snapshot> {
        for source in &self.sources {
            match source.fetch(mint).await {
                Ok(records) if !records.is_empty() => {
                    info!(source = source.name(), accounts = records.len(), "snapshot fetched");
                    return Ok(Snapshot {
                        source: source.name().to_string(),
                        records,
                    });
                }
                Ok(_) => {
                    debug!(source = source.name(), "snapshot source returned no accounts");
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "snapshot source failed, trying next");
                }
            }
        }
        Err(DistributionError::NoSnapshotData(mint.to_string()))
    }
}

/// Reads every token account of `mint` held under one token program.
pub struct ProgramAccountsSource {
    client: Arc<RpcClient>,
    name: String,
    token_program: Pubkey,
    exact_size: bool,
}

impl ProgramAccountsSource {
    pub fn spl_token(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            name: "spl-token".to_string(),
            token_program: spl_token::id(),
            exact_size: true,
        }
    }

    /// Token-2022 accounts may carry extensions, so no size filter.
    pub fn token_2022(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            name: "token-2022".to_string(),
            token_program: spl_token_2022::id(),
            exact_size: false,
        }
    }
}

#[async_trait]
impl SnapshotSource for ProgramAccountsSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, mint: &Pubkey) -> DistributionResult<Vec<HolderRecord>> {
        let mut filters = vec![RpcFilterType::Memcmp(Memcmp::new_base58_encoded(
            0,
            mint.as_ref(),
        ))];
        if self.exact_size {
            filters.push(RpcFilterType::DataSize(TokenAccount::LEN as u64));
        }
        let config = RpcProgramAccountsConfig {
            filters: Some(filters),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                commitment: Some(CommitmentConfig::confirmed()),
                ..Default::default()
            },
            ..Default::default()
        };

        let accounts = self
            .client
            .get_program_accounts_with_config(&self.token_program, config)
            .await
            .map_err(|e| DistributionError::Snapshot {
                source_name: self.name.clone(),
                message: e.to_string(),
            })?;

        let mut records = Vec::with_capacity(accounts.len());
        for (address, account) in accounts {
            match decode_token_account(&account.data) {
                Some(token_account) => records.push(HolderRecord {
                    owner: token_account.owner.to_string(),
                    amount: token_account.amount,
                    program: Some(account.owner),
                }),
                None => debug!(%address, "skipping undecodable token account"),
            }
        }
        Ok(records)
    }
}

fn decode_token_account(data: &[u8]) -> Option<TokenAccount> {
    if data.len() < TokenAccount::LEN {
        return None;
    }
    if data.len() > TokenAccount::LEN && data[TokenAccount::LEN] != TOKEN_2022_ACCOUNT_TYPE_ACCOUNT {
        return None;
    }
    TokenAccount::unpack_from_slice(&data[..TokenAccount::LEN]).ok()
}

#[derive(Debug, Deserialize, Serialize)]
struct SnapshotRow {
    owner: String,
    #[serde(deserialize_with = "serde_aux::field_attributes::deserialize_number_from_string")]
    amount: u64,
}

/// `owner,amount` CSV exported from an earlier snapshot or an indexer.
pub struct CsvSnapshotSource {
    path: PathBuf,
}

impl CsvSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for CsvSnapshotSource {
    fn name(&self) -> &str {
        "csv"
    }

    async fn fetch(&self, _mint: &Pubkey) -> DistributionResult<Vec<HolderRecord>> {
        let snapshot_error = |message: String| DistributionError::Snapshot {
            source_name: format!("csv:{}", self.path.display()),
            message,
        };
        let mut reader = Reader::from_path(&self.path).map_err(|e| snapshot_error(e.to_string()))?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            let row: SnapshotRow = row.map_err(|e| snapshot_error(e.to_string()))?;
            records.push(HolderRecord::new(row.owner, row.amount));
        }
        Ok(records)
    }
}

/// Counts from one pass of [`SnapshotFilter::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub holders: Vec<HolderRecord>,
    pub zero_balance: usize,
    pub blacklisted: usize,
    pub pool_owned: usize,
    /// Extra token accounts folded into an owner already seen.
    pub merged_accounts: usize,
}

/// Drops zero balances, blacklisted wallets and anything owned by a pool
/// program, then folds multiple token accounts of one owner together.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pool_programs: HashSet<Pubkey>,
    blacklist: HashSet<Pubkey>,
}

impl SnapshotFilter {
    pub fn new(pool_programs: HashSet<Pubkey>, blacklist: HashSet<Pubkey>) -> Self {
        Self {
            pool_programs,
            blacklist,
        }
    }

    pub fn is_pool(&self, key: &Pubkey) -> bool {
        self.pool_programs.contains(key)
    }

    pub fn apply(&self, records: Vec<HolderRecord>) -> FilterReport {
        let mut report = FilterReport::default();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for record in records {
            if record.amount == 0 {
                report.zero_balance += 1;
                continue;
            }

            let owner_key = Pubkey::from_str(&record.owner).ok();
            if owner_key.map_or(false, |k| self.blacklist.contains(&k)) {
                debug!(owner = %record.owner, "blacklisted holder excluded");
                report.blacklisted += 1;
                continue;
            }
            let pool_owned = owner_key.map_or(false, |k| self.is_pool(&k))
                || record.program.map_or(false, |p| self.is_pool(&p));
            if pool_owned {
                report.pool_owned += 1;
                continue;
            }

            match seen.get(&record.owner) {
                Some(&idx) => {
                    let holder = &mut report.holders[idx];
                    holder.amount = holder.amount.saturating_add(record.amount);
                    report.merged_accounts += 1;
                }
                None => {
                    seen.insert(record.owner.clone(), report.holders.len());
                    report.holders.push(record);
                }
            }
        }

        info!(
            eligible = report.holders.len(),
            zero_balance = report.zero_balance,
            blacklisted = report.blacklisted,
            pool_owned = report.pool_owned,
            merged = report.merged_accounts,
            "snapshot filtered"
        );
        report
    }
}
