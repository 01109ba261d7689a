//! Packs validated recipients into fixed-size transfer batches.
//!
//! A batch becomes one transaction. Recipients without a token account get
//! an idempotent create instruction placed right before their transfer, in
//! the same batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::{hash::Hash, instruction::Instruction, pubkey::Pubkey};
use spl_associated_token_account::{
    get_associated_token_address_with_program_id,
    instruction::create_associated_token_account_idempotent,
};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    allocation::AllocatedHolder,
    error::{DistributionError, DistributionResult},
};

#[async_trait]
pub trait AccountExistenceCheck: Send + Sync {
    async fn exists(&self, account: &Pubkey) -> DistributionResult<bool>;

    /// Bulk form; implementations backed by a batched RPC should override.
    async fn exists_many(&self, accounts: &[Pubkey]) -> DistributionResult<Vec<bool>> {
        let mut out = Vec::with_capacity(accounts.len());
        for account in accounts {
            out.push(self.exists(account).await?);
        }
        Ok(out)
    }
}

/// Supplies the recent-blockhash a transaction is signed against.
#[async_trait]
pub trait FreshnessSource: Send + Sync {
    async fn latest_blockhash(&self) -> DistributionResult<Hash>;
}

pub trait TransferInstructionBuilder: Send + Sync {
    /// Token account that receives `owner`'s transfer.
    fn destination_account(&self, owner: &Pubkey) -> Pubkey;

    fn transfer(
        &self,
        from: &Pubkey,
        to: &Pubkey,
        authority: &Pubkey,
        amount: u64,
    ) -> DistributionResult<Instruction>;

    /// Creates `destination_account(owner)`, funded by `payer`.
    fn create_account(&self, payer: &Pubkey, owner: &Pubkey) -> Instruction;
}

/// SPL Token / Token-2022 instructions for one distribution mint.
#[derive(Debug, Clone)]
pub struct SplTransferInstructions {
    mint: Pubkey,
    token_program: Pubkey,
    decimals: u8,
}

impl SplTransferInstructions {
    pub fn new(mint: Pubkey, token_program: Pubkey, decimals: u8) -> Self {
        Self {
            mint,
            token_program,
            decimals,
        }
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }
}

impl TransferInstructionBuilder for SplTransferInstructions {
    fn destination_account(&self, owner: &Pubkey) -> Pubkey {
        get_associated_token_address_with_program_id(owner, &self.mint, &self.token_program)
    }

    fn transfer(
        &self,
        from: &Pubkey,
        to: &Pubkey,
        authority: &Pubkey,
        amount: u64,
    ) -> DistributionResult<Instruction> {
        // token-2022's builder accepts either token program id
        spl_token_2022::instruction::transfer_checked(
            &self.token_program,
            from,
            &self.mint,
            to,
            authority,
            &[],
            amount,
            self.decimals,
        )
        .map_err(|e| DistributionError::Instruction(e.to_string()))
    }

    fn create_account(&self, payer: &Pubkey, owner: &Pubkey) -> Instruction {
        create_associated_token_account_idempotent(payer, owner, &self.mint, &self.token_program)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub recipient: AllocatedHolder,
    pub destination: Pubkey,
    pub destination_exists: bool,
}

/// One atomic submission unit.
#[derive(Debug, Clone)]
pub struct TransferBatch {
    pub id: usize,
    pub entries: Vec<BatchEntry>,
    /// Transfer order matches `entries`; creates precede their transfer.
    pub instructions: Vec<Instruction>,
    pub blockhash: Hash,
    pub built_at: Instant,
}

impl TransferBatch {
    pub fn total_amount(&self) -> u64 {
        self.entries.iter().map(|e| e.recipient.payout).sum()
    }

    pub fn recipients(&self) -> impl Iterator<Item = &Pubkey> {
        self.entries.iter().map(|e| &e.recipient.owner)
    }

    pub fn account_creations(&self) -> usize {
        self.entries.iter().filter(|e| !e.destination_exists).count()
    }
}

/// Accounts that sign or pay for every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferAccounts {
    pub source: Pubkey,
    pub authority: Pubkey,
    pub payer: Pubkey,
}

pub struct BatchBuilder<'a> {
    existence: &'a dyn AccountExistenceCheck,
    freshness: &'a dyn FreshnessSource,
    instructions: &'a dyn TransferInstructionBuilder,
    accounts: TransferAccounts,
    transfers_per_tx: usize,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(
        existence: &'a dyn AccountExistenceCheck,
        freshness: &'a dyn FreshnessSource,
        instructions: &'a dyn TransferInstructionBuilder,
        accounts: TransferAccounts,
        transfers_per_tx: usize,
    ) -> Self {
        Self {
            existence,
            freshness,
            instructions,
            accounts,
            transfers_per_tx: transfers_per_tx.max(1),
        }
    }

    /// ⌈n / transfers_per_tx⌉ batches; every recipient lands in exactly one.
    pub async fn build(&self, recipients: Vec<AllocatedHolder>) -> DistributionResult<Vec<TransferBatch>> {
        let destinations: Vec<Pubkey> = recipients
            .iter()
            .map(|r| self.instructions.destination_account(&r.owner))
            .collect();

        let exists = match self.existence.exists_many(&destinations).await {
            Ok(flags) if flags.len() == destinations.len() => flags,
            Ok(flags) => {
                warn!(
                    expected = destinations.len(),
                    got = flags.len(),
                    "existence check returned wrong count, creating all destinations"
                );
                vec![false; destinations.len()]
            }
            Err(e) => {
                // create instructions are idempotent, so assuming absence is safe
                warn!(error = %e, "existence check failed, creating all destinations");
                vec![false; destinations.len()]
            }
        };

        let mut entries: Vec<BatchEntry> = recipients
            .into_iter()
            .zip(destinations)
            .zip(exists)
            .map(|((recipient, destination), destination_exists)| BatchEntry {
                recipient,
                destination,
                destination_exists,
            })
            .collect();

        let mut batches = Vec::with_capacity(entries.len().div_ceil(self.transfers_per_tx));
        while !entries.is_empty() {
            let rest = entries.split_off(entries.len().min(self.transfers_per_tx));
            let chunk = std::mem::replace(&mut entries, rest);
            let batch = self.assemble(batches.len(), chunk).await?;
            debug!(
                batch = batch.id,
                transfers = batch.entries.len(),
                creates = batch.account_creations(),
                "batch built"
            );
            batches.push(batch);
        }

        info!(
            batches = batches.len(),
            creates = batches.iter().map(|b| b.account_creations()).sum::<usize>(),
            "transfer batches built"
        );
        Ok(batches)
    }

    async fn assemble(&self, id: usize, entries: Vec<BatchEntry>) -> DistributionResult<TransferBatch> {
        let mut instructions = Vec::with_capacity(entries.len() * 2);
        for entry in &entries {
            if !entry.destination_exists {
                instructions.push(
                    self.instructions
                        .create_account(&self.accounts.payer, &entry.recipient.owner),
                );
            }
            instructions.push(self.instructions.transfer(
                &self.accounts.source,
                &entry.destination,
                &self.accounts.authority,
                entry.recipient.payout,
            )?);
        }
        // Blockhashes expire, so each batch fetches its own at build time.
        let blockhash = self.freshness.latest_blockhash().await?;
        Ok(TransferBatch {
            id,
            entries,
            instructions,
            blockhash,
            built_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use solana_sdk::signature::{Keypair, Signer};
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicU64, Ordering},
    };

    struct KnownAccounts(HashSet<Pubkey>);

    #[async_trait]
    impl AccountExistenceCheck for KnownAccounts {
        async fn exists(&self, account: &Pubkey) -> DistributionResult<bool> {
            Ok(self.0.contains(account))
        }
    }

    struct FailingExistence;

    #[async_trait]
    impl AccountExistenceCheck for FailingExistence {
        async fn exists(&self, _account: &Pubkey) -> DistributionResult<bool> {
            Err(DistributionError::Rpc("connection reset".into()))
        }
    }

    struct CountingBlockhash(AtomicU64);

    #[async_trait]
    impl FreshnessSource for CountingBlockhash {
        async fn latest_blockhash(&self) -> DistributionResult<Hash> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(solana_sdk::hash::hash(&n.to_le_bytes()))
        }
    }

    fn recipients(n: usize) -> Vec<AllocatedHolder> {
        (0..n)
            .map(|i| AllocatedHolder {
                owner: Keypair::new().pubkey(),
                raw_amount: 100,
                bonus_amount: 0,
                multiplier: 1.0,
                points: 100.0,
                share_fraction: 0.1,
                payout: 1_000 + i as u64,
            })
            .collect()
    }

    fn accounts() -> TransferAccounts {
        TransferAccounts {
            source: Pubkey::new_unique(),
            authority: Pubkey::new_unique(),
            payer: Pubkey::new_unique(),
        }
    }

    fn spl() -> SplTransferInstructions {
        SplTransferInstructions::new(Pubkey::new_unique(), spl_token::id(), 6)
    }

    #[tokio::test]
    async fn test_seven_recipients_make_three_batches() {
        let existence = KnownAccounts(HashSet::new());
        let freshness = CountingBlockhash(AtomicU64::new(0));
        let spl = spl();
        let builder = BatchBuilder::new(&existence, &freshness, &spl, accounts(), 3);

        let input = recipients(7);
        let batches = builder.build(input.clone()).await.unwrap();

        let sizes: Vec<usize> = batches.iter().map(|b| b.entries.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        let ids: Vec<usize> = batches.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let flattened: Vec<Pubkey> = batches.iter().flat_map(|b| b.recipients().copied()).collect();
        let expected: Vec<Pubkey> = input.iter().map(|r| r.owner).collect();
        assert_eq!(flattened, expected);

        // each batch got its own blockhash
        let hashes: HashSet<Hash> = batches.iter().map(|b| b.blockhash).collect();
        assert_eq!(hashes.len(), 3);
    }

    #[tokio::test]
    async fn test_create_precedes_transfer_only_when_missing() {
        let spl = spl();
        let input = recipients(2);
        let existing = spl.destination_account(&input[1].owner);
        let existence = KnownAccounts([existing].into_iter().collect());
        let freshness = CountingBlockhash(AtomicU64::new(0));
        let accounts = accounts();
        let builder = BatchBuilder::new(&existence, &freshness, &spl, accounts, 3);

        let batches = builder.build(input.clone()).await.unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.account_creations(), 1);
        assert_eq!(batch.instructions.len(), 3);

        assert_eq!(batch.instructions[0].program_id, spl_associated_token_account::id());
        assert_eq!(batch.instructions[1].program_id, spl_token::id());
        assert_eq!(batch.instructions[2].program_id, spl_token::id());
        // transfer_checked accounts: source, mint, destination, authority
        assert_eq!(batch.instructions[1].accounts[0].pubkey, accounts.source);
        assert_eq!(
            batch.instructions[1].accounts[2].pubkey,
            spl.destination_account(&input[0].owner)
        );
        assert_eq!(batch.instructions[2].accounts[2].pubkey, existing);
        assert_eq!(batch.total_amount(), input[0].payout + input[1].payout);
    }

    #[tokio::test]
    async fn test_failed_existence_check_creates_everything() {
        let spl = spl();
        let freshness = CountingBlockhash(AtomicU64::new(0));
        let builder = BatchBuilder::new(&FailingExistence, &freshness, &spl, accounts(), 2);

        let batches = builder.build(recipients(3)).await.unwrap();
        assert_eq!(batches.iter().map(|b| b.account_creations()).sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn test_empty_input_builds_nothing() {
        let spl = spl();
        let existence = KnownAccounts(HashSet::new());
        let freshness = CountingBlockhash(AtomicU64::new(0));
        let builder = BatchBuilder::new(&existence, &freshness, &spl, accounts(), 3);
        assert!(builder.build(vec![]).await.unwrap().is_empty());
        assert_eq!(freshness.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_token_2022_destinations_differ() {
        let mint = Pubkey::new_unique();
        let owner = Keypair::new().pubkey();
        let classic = SplTransferInstructions::new(mint, spl_token::id(), 9);
        let t22 = SplTransferInstructions::new(mint, spl_token_2022::id(), 9);
        assert_ne!(classic.destination_account(&owner), t22.destination_account(&owner));

        let ix = t22
            .transfer(&Pubkey::new_unique(), &t22.destination_account(&owner), &Pubkey::new_unique(), 5)
            .unwrap();
        assert_eq!(ix.program_id, spl_token_2022::id());
    }

    proptest! {
        #[test]
        fn prop_batches_partition_recipients_in_order(n in 0usize..60, k in 1usize..=10) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let spl = spl();
            let existence = KnownAccounts(HashSet::new());
            let freshness = CountingBlockhash(AtomicU64::new(0));
            let builder = BatchBuilder::new(&existence, &freshness, &spl, accounts(), k);

            let input = recipients(n);
            let batches = runtime.block_on(builder.build(input.clone())).unwrap();

            prop_assert_eq!(batches.len(), n.div_ceil(k));
            for (i, batch) in batches.iter().enumerate() {
                prop_assert_eq!(batch.id, i);
                prop_assert!(!batch.entries.is_empty() && batch.entries.len() <= k);
            }
            let flattened: Vec<Pubkey> = batches.iter().flat_map(|b| b.recipients().copied()).collect();
            let expected: Vec<Pubkey> = input.iter().map(|r| r.owner).collect();
            prop_assert_eq!(flattened, expected);
        }
    }
}
