//! Run orchestration.
//!
//! `plan` walks a snapshot through filter, scoring, allocation, validation
//! and batch building without touching the ledger. `execute` dispatches the
//! planned batches and commits the history record. The split lets the CLI
//! show a dry run or ask for confirmation in between.

use std::sync::Arc;

use solana_sdk::pubkey::Pubkey;
use tracing::info;

use crate::{
    allocation::{allocate, AllocatedHolder, DustPolicy},
    batch::{AccountExistenceCheck, BatchBuilder, FreshnessSource, TransferAccounts, TransferBatch, TransferInstructionBuilder},
    config::DistributionConfig,
    dispatch::{DispatchReport, Dispatcher, SubmissionEndpoint},
    error::DistributionResult,
    history::{DistributionRun, HistoryStore, LedgerRecorder},
    recipients::RecipientValidator,
    snapshot::{SnapshotChain, SnapshotFilter},
    weights::{BonusStateLookup, WeightCalculator},
};

/// Everything the engine talks to.
pub struct Collaborators<'a> {
    pub snapshot: &'a SnapshotChain,
    pub bonus: &'a dyn BonusStateLookup,
    pub existence: &'a dyn AccountExistenceCheck,
    pub freshness: &'a dyn FreshnessSource,
    pub instructions: &'a dyn TransferInstructionBuilder,
    pub endpoint: Arc<dyn SubmissionEndpoint>,
    pub history: &'a dyn HistoryStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionTarget {
    /// Mint whose holders are rewarded.
    pub snapshot_mint: Pubkey,
    /// Mint paid out.
    pub distribution_mint: Pubkey,
    pub accounts: TransferAccounts,
}

/// Per-stage drop counts for one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanCounts {
    pub snapshot_accounts: usize,
    pub zero_balance: usize,
    pub blacklisted: usize,
    pub pool_owned: usize,
    pub merged_accounts: usize,
    pub eligible_holders: usize,
    pub malformed: usize,
    pub lookup_failures: usize,
    pub with_bonus: usize,
    pub below_cutoff: usize,
    pub off_curve: usize,
    pub excluded_recipients: usize,
}

#[derive(Debug, Clone)]
pub struct DistributionPlan {
    pub snapshot_source: String,
    pub pool: u64,
    pub total_points: f64,
    pub counts: PlanCounts,
    pub recipients: Vec<AllocatedHolder>,
    pub batches: Vec<TransferBatch>,
}

impl DistributionPlan {
    pub fn total_payout(&self) -> u64 {
        self.recipients.iter().map(|r| r.payout).sum()
    }

    pub fn account_creations(&self) -> usize {
        self.batches.iter().map(|b| b.account_creations()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub counts: PlanCounts,
    pub report: DispatchReport,
    /// `None` when there was nothing to send and no record was written.
    pub run: Option<DistributionRun>,
    pub total_distributed_all_time: Option<u64>,
}

pub struct DistributionEngine<'a> {
    config: DistributionConfig,
    target: DistributionTarget,
    collaborators: Collaborators<'a>,
    filter: SnapshotFilter,
    validator: RecipientValidator,
    show_progress: bool,
}

impl<'a> DistributionEngine<'a> {
    pub fn new(
        config: DistributionConfig,
        target: DistributionTarget,
        collaborators: Collaborators<'a>,
    ) -> DistributionResult<Self> {
        config.validate()?;
        let filter = SnapshotFilter::new(config.pool_program_set()?, config.blacklist_set()?);
        let accounts = target.accounts;
        let validator = RecipientValidator::new([accounts.source, accounts.authority, accounts.payer]);
        Ok(Self {
            config,
            target,
            collaborators,
            filter,
            validator,
            show_progress: false,
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// Stages up to built batches. Nothing is submitted.
    pub async fn plan(&self, pool: u64) -> DistributionResult<DistributionPlan> {
        let snapshot = self.collaborators.snapshot.fetch(&self.target.snapshot_mint).await?;
        let mut counts = PlanCounts {
            snapshot_accounts: snapshot.records.len(),
            ..Default::default()
        };

        let filtered = self.filter.apply(snapshot.records);
        counts.zero_balance = filtered.zero_balance;
        counts.blacklisted = filtered.blacklisted;
        counts.pool_owned = filtered.pool_owned;
        counts.merged_accounts = filtered.merged_accounts;
        counts.eligible_holders = filtered.holders.len();

        let scored = WeightCalculator::new(self.collaborators.bonus, &self.config)
            .with_progress(self.show_progress)
            .score(&filtered.holders)
            .await;
        counts.malformed = scored.malformed;
        counts.lookup_failures = scored.lookup_failures;
        counts.with_bonus = scored.with_bonus;

        let dust = DustPolicy {
            min_points: self.config.min_points,
            min_payout: self.config.min_payout,
        };
        let allocation = allocate(scored.holders, pool, dust);
        counts.below_cutoff = allocation.below_cutoff.len();

        let validated = self.validator.validate(allocation.allocated);
        counts.off_curve = validated.off_curve;
        counts.excluded_recipients = validated.excluded;

        let batches = BatchBuilder::new(
            self.collaborators.existence,
            self.collaborators.freshness,
            self.collaborators.instructions,
            self.target.accounts,
            self.config.transfers_per_tx,
        )
        .build(validated.valid.clone())
        .await?;

        Ok(DistributionPlan {
            snapshot_source: snapshot.source,
            pool,
            total_points: allocation.total_points,
            counts,
            recipients: validated.valid,
            batches,
        })
    }

    /// Dispatches the plan and records the run. Returns only after the
    /// history write, or with `HistoryPersist` carrying the run if it failed.
    /// A history that cannot be read fails the call before any submission.
    pub async fn execute(&self, plan: DistributionPlan) -> DistributionResult<RunSummary> {
        if plan.is_empty() {
            info!("no recipients, nothing dispatched or recorded");
            return Ok(RunSummary {
                counts: plan.counts,
                report: DispatchReport::default(),
                run: None,
                total_distributed_all_time: None,
            });
        }

        // an unreadable history must abort before anything is sent
        self.collaborators.history.load()?;

        let report = Dispatcher::new(self.collaborators.endpoint.clone(), &self.config)
            .with_progress(self.show_progress)
            .dispatch(plan.batches)
            .await;

        let run = DistributionRun::from_report(&self.target.snapshot_mint, &self.target.distribution_mint, &report);
        let history = LedgerRecorder::new(self.collaborators.history).record(run)?;

        Ok(RunSummary {
            counts: plan.counts,
            report,
            run: history.runs.last().cloned(),
            total_distributed_all_time: Some(history.total_distributed_all_time),
        })
    }

    pub async fn run(&self, pool: u64) -> DistributionResult<RunSummary> {
        let plan = self.plan(pool).await?;
        self.execute(plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::SplTransferInstructions,
        error::{DistributionError, SubmitError},
        history::DistributionHistory,
        snapshot::{HolderRecord, SnapshotSource},
        weights::BonusState,
    };
    use async_trait::async_trait;
    use solana_sdk::{
        hash::Hash,
        signature::{Keypair, Signature, Signer},
    };
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    struct VecSource(Vec<HolderRecord>);

    #[async_trait]
    impl SnapshotSource for VecSource {
        fn name(&self) -> &str {
            "fixture"
        }

        async fn fetch(&self, _mint: &Pubkey) -> DistributionResult<Vec<HolderRecord>> {
            Ok(self.0.clone())
        }
    }

    struct MapBonus(HashMap<Pubkey, BonusState>);

    #[async_trait]
    impl BonusStateLookup for MapBonus {
        async fn fetch(&self, owner: &Pubkey) -> DistributionResult<Option<BonusState>> {
            Ok(self.0.get(owner).copied())
        }
    }

    struct NothingExists;

    #[async_trait]
    impl AccountExistenceCheck for NothingExists {
        async fn exists(&self, _account: &Pubkey) -> DistributionResult<bool> {
            Ok(false)
        }
    }

    struct FixedBlockhash;

    #[async_trait]
    impl FreshnessSource for FixedBlockhash {
        async fn latest_blockhash(&self) -> DistributionResult<Hash> {
            Ok(Hash::new_unique())
        }
    }

    /// Rejects any batch containing one of `poisoned`.
    #[derive(Default)]
    struct Endpoint {
        poisoned: HashSet<Pubkey>,
        submitted: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl SubmissionEndpoint for Endpoint {
        async fn submit(&self, batch: &TransferBatch) -> Result<Signature, SubmitError> {
            self.submitted.lock().unwrap().push(batch.id);
            if batch.recipients().any(|r| self.poisoned.contains(r)) {
                return Err(SubmitError::Rejected("custom program error: 0x1".into()));
            }
            Ok(Signature::new_unique())
        }
    }

    #[derive(Default)]
    struct MemoryHistory {
        history: Mutex<DistributionHistory>,
        fail_load: bool,
        fail_save: bool,
    }

    impl HistoryStore for MemoryHistory {
        fn load(&self) -> DistributionResult<DistributionHistory> {
            if self.fail_load {
                return Err(DistributionError::HistoryLoad("expected value at line 1 column 2".into()));
            }
            Ok(self.history.lock().unwrap().clone())
        }

        fn save(&self, history: &DistributionHistory) -> DistributionResult<()> {
            if self.fail_save {
                return Err(DistributionError::HistoryWrite("read-only filesystem".into()));
            }
            *self.history.lock().unwrap() = history.clone();
            Ok(())
        }
    }

    struct Fixture {
        chain: SnapshotChain,
        bonus: MapBonus,
        instructions: SplTransferInstructions,
        endpoint: Arc<Endpoint>,
        history: MemoryHistory,
        target: DistributionTarget,
    }

    impl Fixture {
        fn new(records: Vec<HolderRecord>, bonus: HashMap<Pubkey, BonusState>) -> Self {
            let distribution_mint = Pubkey::new_unique();
            Self {
                chain: SnapshotChain::new(vec![Box::new(VecSource(records))]),
                bonus: MapBonus(bonus),
                instructions: SplTransferInstructions::new(distribution_mint, spl_token::id(), 6),
                endpoint: Arc::new(Endpoint::default()),
                history: MemoryHistory::default(),
                target: DistributionTarget {
                    snapshot_mint: Pubkey::new_unique(),
                    distribution_mint,
                    accounts: TransferAccounts {
                        source: Pubkey::new_unique(),
                        authority: Keypair::new().pubkey(),
                        payer: Keypair::new().pubkey(),
                    },
                },
            }
        }

        fn engine(&self, config: DistributionConfig) -> DistributionEngine<'_> {
            let collaborators = Collaborators {
                snapshot: &self.chain,
                bonus: &self.bonus,
                existence: &NothingExists,
                freshness: &FixedBlockhash,
                instructions: &self.instructions,
                endpoint: self.endpoint.clone(),
                history: &self.history,
            };
            DistributionEngine::new(config, self.target, collaborators).unwrap()
        }
    }

    fn config() -> DistributionConfig {
        DistributionConfig {
            transfers_per_tx: 3,
            retry_backoff_ms: 1,
            rate_limit: 0,
            lookup_group_delay_ms: 0,
            min_payout: 0,
            ..Default::default()
        }
    }

    fn wallet() -> Pubkey {
        Keypair::new().pubkey()
    }

    #[tokio::test]
    async fn test_worked_example_end_to_end() {
        let a = wallet();
        let b = wallet();
        let fixture = Fixture::new(
            vec![HolderRecord::new(a.to_string(), 1000), HolderRecord::new(b.to_string(), 500)],
            [(b, BonusState { bonus_amount: 1000, multiplier: 1.5 })].into_iter().collect(),
        );
        let engine = fixture.engine(config());

        let plan = engine.plan(1000).await.unwrap();
        assert_eq!(plan.total_points, 4750.0);
        let payouts: Vec<u64> = plan.recipients.iter().map(|r| r.payout).collect();
        assert_eq!(payouts, vec![210, 789]);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.account_creations(), 2);

        let summary = engine.execute(plan).await.unwrap();
        let run = summary.run.unwrap();
        assert_eq!(run.total_amount_distributed, 999);
        assert_eq!(run.recipient_count, 2);
        assert_eq!(summary.total_distributed_all_time, Some(999));
        assert_eq!(fixture.history.history.lock().unwrap().runs.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_excluded_from_distributed_total() {
        let owners: Vec<Pubkey> = (0..7).map(|_| wallet()).collect();
        let records = owners.iter().map(|o| HolderRecord::new(o.to_string(), 100)).collect();
        let mut fixture = Fixture::new(records, HashMap::new());
        // poison the middle batch
        Arc::get_mut(&mut fixture.endpoint).unwrap().poisoned.insert(owners[4]);
        let engine = fixture.engine(config());

        let summary = engine.run(7_000).await.unwrap();
        let sizes: Vec<usize> = summary.report.results.iter().map(|r| r.recipients.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let run = summary.run.unwrap();
        assert_eq!(run.allocated_amount, 7_000);
        assert_eq!(run.total_amount_distributed, 4_000);
        assert_eq!(run.failed_recipient_count, 3);
        assert_eq!(run.confirmed_batches(), 2);
        // rejected batches are not retried
        assert_eq!(fixture.endpoint.submitted.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_nothing_eligible_is_a_quiet_no_op() {
        let fixture = Fixture::new(
            vec![HolderRecord::new(wallet().to_string(), 0), HolderRecord::new(wallet().to_string(), 0)],
            HashMap::new(),
        );
        let summary = fixture.engine(config()).run(1_000_000).await.unwrap();
        assert!(summary.run.is_none());
        assert!(summary.report.results.is_empty());
        assert_eq!(summary.counts.zero_balance, 2);
        assert!(fixture.history.history.lock().unwrap().runs.is_empty());
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_fatal() {
        let fixture = Fixture::new(vec![], HashMap::new());
        let err = fixture.engine(config()).run(1_000).await.unwrap_err();
        assert!(matches!(err, DistributionError::NoSnapshotData(_)));
    }

    #[tokio::test]
    async fn test_history_failure_keeps_confirmed_signatures() {
        let records = (0..4).map(|_| HolderRecord::new(wallet().to_string(), 10)).collect();
        let mut fixture = Fixture::new(records, HashMap::new());
        fixture.history.fail_save = true;
        let engine = fixture.engine(config());

        match engine.run(4_000).await {
            Err(DistributionError::HistoryPersist { run, .. }) => {
                assert_eq!(run.signatures().len(), 2);
                assert_eq!(run.total_amount_distributed, 4_000);
            }
            other => panic!("expected HistoryPersist, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreadable_history_aborts_before_sending() {
        let records = (0..4).map(|_| HolderRecord::new(wallet().to_string(), 10)).collect();
        let mut fixture = Fixture::new(records, HashMap::new());
        fixture.history.fail_load = true;
        let engine = fixture.engine(config());

        let plan = engine.plan(4_000).await.unwrap();
        assert_eq!(plan.batches.len(), 2);
        let err = engine.execute(plan).await.unwrap_err();
        assert!(matches!(err, DistributionError::HistoryLoad(_)));
        assert!(fixture.endpoint.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_targets_compare_by_accounts() {
        let fixture = Fixture::new(vec![], HashMap::new());
        let same = fixture.target;
        assert_eq!(same, fixture.target);

        let other_payer = DistributionTarget {
            accounts: TransferAccounts {
                payer: Pubkey::new_unique(),
                ..fixture.target.accounts
            },
            ..fixture.target
        };
        assert_ne!(other_payer, fixture.target);
    }

    #[tokio::test]
    async fn test_distributor_and_off_curve_holders_never_paid() {
        let holder = wallet();
        let (pda, _) = Pubkey::find_program_address(&[b"vault"], &Pubkey::new_unique());
        let mut fixture = Fixture::new(vec![], HashMap::new());
        let payer = fixture.target.accounts.payer;
        fixture.chain = SnapshotChain::new(vec![Box::new(VecSource(vec![
            HolderRecord::new(holder.to_string(), 100),
            HolderRecord::new(pda.to_string(), 100),
            HolderRecord::new(payer.to_string(), 100),
        ]))]);

        let plan = fixture.engine(config()).plan(3_000).await.unwrap();
        assert_eq!(plan.recipients.len(), 1);
        assert_eq!(plan.recipients[0].owner, holder);
        assert_eq!(plan.counts.off_curve, 1);
        assert_eq!(plan.counts.excluded_recipients, 1);
        // their shares stay with the distributor
        assert_eq!(plan.total_payout(), 1_000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let fixture = Fixture::new(vec![], HashMap::new());
        let collaborators = Collaborators {
            snapshot: &fixture.chain,
            bonus: &fixture.bonus,
            existence: &NothingExists,
            freshness: &FixedBlockhash,
            instructions: &fixture.instructions,
            endpoint: fixture.endpoint.clone(),
            history: &fixture.history,
        };
        let config = DistributionConfig {
            transfers_per_tx: 0,
            ..config()
        };
        assert!(matches!(
            DistributionEngine::new(config, fixture.target, collaborators),
            Err(DistributionError::Config(_))
        ));
    }
}
