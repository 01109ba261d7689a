//! RPC-backed collaborators: account existence, blockhash freshness, batch
//! submission with confirmation, and the mint/source lookups the CLI needs
//! before a run.

use async_trait::async_trait;
use solana_client::{
    client_error::ClientError, nonblocking::rpc_client::RpcClient,
    rpc_config::RpcSimulateTransactionConfig,
};
use solana_sdk::{
    commitment_config::CommitmentConfig,
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::Instruction,
    message::{Message, VersionedMessage},
    packet::PACKET_DATA_SIZE,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::{TransactionError, VersionedTransaction},
};
use solana_transaction_status::TransactionStatus;
use spl_token_2022::{
    extension::StateWithExtensions,
    state::{Account as TokenAccount, Mint},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    batch::{AccountExistenceCheck, FreshnessSource, TransferBatch},
    dispatch::SubmissionEndpoint,
    error::{DistributionError, DistributionResult, SubmitError},
};

/// `get_multiple_accounts` accepts at most this many keys.
const MULTIPLE_ACCOUNTS_LIMIT: usize = 100;
const UDP_HEADROOM: usize = 100;
const MAX_COMPUTE_UNITS: u32 = 1_400_000;
/// Slots a blockhash stays usable; a transaction unseen after this is dead.
const BLOCKHASH_VALIDITY_SLOTS: u64 = 150;
/// Batches older than this get a new blockhash before signing.
const MAX_BLOCKHASH_AGE: Duration = Duration::from_secs(30);
const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn rpc_error(e: ClientError) -> DistributionError {
    DistributionError::Rpc(e.to_string())
}

pub struct RpcAccountExistence {
    client: Arc<RpcClient>,
}

impl RpcAccountExistence {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccountExistenceCheck for RpcAccountExistence {
    async fn exists(&self, account: &Pubkey) -> DistributionResult<bool> {
        let response = self
            .client
            .get_account_with_commitment(account, self.client.commitment())
            .await
            .map_err(rpc_error)?;
        Ok(response.value.is_some())
    }

    async fn exists_many(&self, accounts: &[Pubkey]) -> DistributionResult<Vec<bool>> {
        let mut out = Vec::with_capacity(accounts.len());
        for chunk in accounts.chunks(MULTIPLE_ACCOUNTS_LIMIT) {
            let found = self.client.get_multiple_accounts(chunk).await.map_err(rpc_error)?;
            out.extend(found.iter().map(Option::is_some));
        }
        Ok(out)
    }
}

pub struct RpcFreshness {
    client: Arc<RpcClient>,
}

impl RpcFreshness {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FreshnessSource for RpcFreshness {
    async fn latest_blockhash(&self) -> DistributionResult<Hash> {
        self.client.get_latest_blockhash().await.map_err(rpc_error)
    }
}

/// Cluster calls the submitter needs, so the resend rules can run against a
/// fake ledger.
#[async_trait]
pub trait SubmissionRpc: Send + Sync {
    async fn latest_blockhash(&self) -> Result<Hash, ClientError>;
    async fn blockhash_is_valid(&self, blockhash: &Hash) -> Result<bool, ClientError>;
    /// Compute unit limit for a transaction carrying `instructions`.
    async fn compute_unit_limit(&self, instructions: &[Instruction], payer: &Pubkey) -> u32;
    async fn send(&self, tx: &VersionedTransaction) -> Result<Signature, ClientError>;
    async fn signature_state(&self, signature: &Signature, search_history: bool) -> Result<SignatureState, ClientError>;
    async fn slot(&self) -> Result<u64, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureState {
    /// Not seen by the cluster.
    Unknown,
    Processed,
    Confirmed,
    Failed(TransactionError),
}

impl From<Option<TransactionStatus>> for SignatureState {
    fn from(status: Option<TransactionStatus>) -> Self {
        match status {
            None => SignatureState::Unknown,
            Some(status) => match status.err.clone() {
                Some(err) => SignatureState::Failed(err),
                None if status.satisfies_commitment(CommitmentConfig::confirmed()) => SignatureState::Confirmed,
                None => SignatureState::Processed,
            },
        }
    }
}

#[async_trait]
impl SubmissionRpc for RpcClient {
    async fn latest_blockhash(&self) -> Result<Hash, ClientError> {
        self.get_latest_blockhash().await
    }

    async fn blockhash_is_valid(&self, blockhash: &Hash) -> Result<bool, ClientError> {
        // processed is the most lenient view, so a copy is never written off early
        self.is_blockhash_valid(blockhash, CommitmentConfig::processed()).await
    }

    async fn compute_unit_limit(&self, instructions: &[Instruction], payer: &Pubkey) -> u32 {
        simulate_compute_units(self, instructions, payer).await
    }

    async fn send(&self, tx: &VersionedTransaction) -> Result<Signature, ClientError> {
        self.send_transaction(tx).await
    }

    async fn signature_state(&self, signature: &Signature, search_history: bool) -> Result<SignatureState, ClientError> {
        let response = if search_history {
            self.get_signature_statuses_with_history(&[*signature]).await?
        } else {
            self.get_signature_statuses(&[*signature]).await?
        };
        Ok(response.value.into_iter().next().flatten().into())
    }

    async fn slot(&self) -> Result<u64, ClientError> {
        self.get_slot().await
    }
}

#[derive(Debug, Clone)]
struct SignedBatch {
    tx: VersionedTransaction,
    signature: Signature,
}

enum Resume {
    Send(SignedBatch),
    Watch(Signature),
    Landed(Signature),
}

/// Signs, sends and confirms batches as legacy transactions with a compute
/// budget prefix.
///
/// A batch keeps its signed transaction across attempts. A retry first asks
/// the cluster about the earlier signature and resends the same bytes while
/// their blockhash is valid; only a copy that expired unseen is signed again.
pub struct RpcSubmitter<C = RpcClient> {
    client: Arc<C>,
    fee_payer: Arc<Keypair>,
    authority: Arc<Keypair>,
    priority_fee: u64,
    poll_interval: Duration,
    signed: Mutex<HashMap<usize, SignedBatch>>,
}

impl<C: SubmissionRpc> RpcSubmitter<C> {
    pub fn new(client: Arc<C>, fee_payer: Arc<Keypair>, authority: Arc<Keypair>, priority_fee: u64) -> Self {
        Self {
            client,
            fee_payer,
            authority,
            priority_fee,
            poll_interval: CONFIRMATION_POLL_INTERVAL,
            signed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn sign(&self, message: VersionedMessage) -> Result<SignedBatch, SubmitError> {
        // owner and fee payer may be the same key
        let signers: Vec<&Keypair> = if self.fee_payer.pubkey() == self.authority.pubkey() {
            vec![self.fee_payer.as_ref()]
        } else {
            vec![self.fee_payer.as_ref(), self.authority.as_ref()]
        };
        let tx = VersionedTransaction::try_new(message, &signers)
            .map_err(|e| SubmitError::Rejected(format!("signing failed: {}", e)))?;
        let signature = tx
            .signatures
            .first()
            .copied()
            .ok_or_else(|| SubmitError::Rejected("transaction has no signature".into()))?;
        Ok(SignedBatch { tx, signature })
    }

    /// Signs `batch` and remembers it as the batch's current copy.
    async fn sign_batch(&self, batch: &TransferBatch, stale: bool) -> Result<SignedBatch, SubmitError> {
        let blockhash = if !stale && batch.built_at.elapsed() < MAX_BLOCKHASH_AGE {
            batch.blockhash
        } else {
            self.client.latest_blockhash().await.map_err(classify_client_error)?
        };

        let payer = self.fee_payer.pubkey();
        let cu_limit = self.client.compute_unit_limit(&batch.instructions, &payer).await;
        let message = legacy_message_with_cu(&batch.instructions, &payer, self.priority_fee, cu_limit, blockhash);
        let signed = self.sign(message)?;

        let (fits, size) = transaction_fits(&signed.tx);
        if !fits {
            return Err(SubmitError::Rejected(format!(
                "transaction would be {} bytes, over the {} byte limit",
                size,
                PACKET_DATA_SIZE - UDP_HEADROOM
            )));
        }

        debug!(batch = batch.id, signature = %signed.signature, cu_limit, "batch signed");
        self.signed.lock().await.insert(batch.id, signed.clone());
        Ok(signed)
    }

    async fn resume(&self, batch: &TransferBatch) -> Result<Resume, SubmitError> {
        let previous = self.signed.lock().await.get(&batch.id).cloned();
        let Some(previous) = previous else {
            return self.sign_batch(batch, false).await.map(Resume::Send);
        };
        let signature = previous.signature;

        // validity before status: an unseen copy with a dead blockhash can never land
        let blockhash_valid = self
            .client
            .blockhash_is_valid(previous.tx.message.recent_blockhash())
            .await
            .map_err(classify_client_error)?;
        match self
            .client
            .signature_state(&signature, true)
            .await
            .map_err(classify_client_error)?
        {
            SignatureState::Confirmed => Ok(Resume::Landed(signature)),
            SignatureState::Processed => Ok(Resume::Watch(signature)),
            SignatureState::Failed(err) => Err(SubmitError::Rejected(format!(
                "transaction {} failed: {}",
                signature, err
            ))),
            SignatureState::Unknown if blockhash_valid => {
                debug!(batch = batch.id, %signature, "resending earlier copy");
                Ok(Resume::Send(previous))
            }
            SignatureState::Unknown => {
                info!(batch = batch.id, %signature, "earlier copy expired unseen, signing again");
                self.sign_batch(batch, true).await.map(Resume::Send)
            }
        }
    }

    async fn attempt(&self, batch: &TransferBatch) -> Result<Signature, SubmitError> {
        let signed = match self.resume(batch).await? {
            Resume::Landed(signature) => return Ok(signature),
            Resume::Watch(signature) => return self.await_confirmation(&signature, None).await,
            Resume::Send(signed) => signed,
        };

        let sent_slot = self.client.slot().await.ok();
        let signature = match self.client.send(&signed.tx).await {
            Ok(signature) => signature,
            Err(e) if is_already_processed(&e) => {
                debug!(batch = batch.id, signature = %signed.signature, "already processed, watching it");
                signed.signature
            }
            Err(e) => {
                let error = classify_client_error(e);
                if let Some(wait) = rate_limit_wait(&error) {
                    warn!(batch = batch.id, wait_secs = wait.as_secs(), "rate limited by rpc");
                    sleep(wait).await;
                }
                return Err(error);
            }
        };
        debug!(batch = batch.id, %signature, "batch sent");

        self.await_confirmation(&signature, sent_slot).await
    }

    async fn await_confirmation(&self, signature: &Signature, mut sent_slot: Option<u64>) -> Result<Signature, SubmitError> {
        loop {
            sleep(self.poll_interval).await;

            match self.client.signature_state(signature, false).await {
                Ok(SignatureState::Confirmed) => return Ok(*signature),
                Ok(SignatureState::Failed(err)) => {
                    return Err(SubmitError::Rejected(format!("transaction {} failed: {}", signature, err)))
                }
                Ok(SignatureState::Processed) => continue,
                Ok(SignatureState::Unknown) => {}
                Err(e) => debug!(%signature, error = %e, "status poll failed"),
            }

            let Ok(current_slot) = self.client.slot().await else {
                continue;
            };
            match sent_slot {
                None => sent_slot = Some(current_slot),
                Some(sent) if current_slot.saturating_sub(sent) > BLOCKHASH_VALIDITY_SLOTS => {
                    return Err(SubmitError::Transient(format!(
                        "transaction {} expired unconfirmed",
                        signature
                    )));
                }
                Some(_) => {}
            }
        }
    }
}

#[async_trait]
impl<C: SubmissionRpc> SubmissionEndpoint for RpcSubmitter<C> {
    async fn submit(&self, batch: &TransferBatch) -> Result<Signature, SubmitError> {
        let result = self.attempt(batch).await;
        // a transient failure keeps the copy for the next attempt to look up
        if !matches!(result, Err(SubmitError::Transient(_))) {
            self.signed.lock().await.remove(&batch.id);
        }
        result
    }
}

fn is_already_processed(error: &ClientError) -> bool {
    matches!(error.get_transaction_error(), Some(TransactionError::AlreadyProcessed))
}

/// Transaction errors the runtime reports are final, except an unknown
/// blockhash and a duplicate of a copy already processed. Anything without a
/// transaction error is transport trouble.
pub fn classify_client_error(error: ClientError) -> SubmitError {
    match error.get_transaction_error() {
        Some(TransactionError::BlockhashNotFound | TransactionError::AlreadyProcessed) => {
            SubmitError::Transient(error.to_string())
        }
        Some(tx_error) => SubmitError::Rejected(tx_error.to_string()),
        None => SubmitError::Transient(error.to_string()),
    }
}

fn rate_limit_wait(error: &SubmitError) -> Option<Duration> {
    let SubmitError::Transient(message) = error else {
        return None;
    };
    if !(message.contains("429") || message.contains("rate")) {
        return None;
    }
    extract_retry_after(message).map(Duration::from_secs)
}

fn extract_retry_after(error_str: &str) -> Option<u64> {
    let pos = error_str.find("Retry-After:")?;
    let after = error_str[pos + "Retry-After:".len()..].trim_start();
    let end = after.find(|c: char| !c.is_ascii_digit()).unwrap_or(after.len());
    after[..end].parse().ok()
}

pub fn legacy_message_with_cu(
    instructions: &[Instruction],
    payer: &Pubkey,
    priority_fee: u64,
    cu_limit: u32,
    blockhash: Hash,
) -> VersionedMessage {
    let mut all_instructions = vec![
        ComputeBudgetInstruction::set_compute_unit_limit(cu_limit),
        ComputeBudgetInstruction::set_compute_unit_price(priority_fee),
    ];
    all_instructions.extend_from_slice(instructions);
    VersionedMessage::Legacy(Message::new_with_blockhash(&all_instructions, Some(payer), &blockhash))
}

/// Serialized size against the packet limit, less UDP headroom.
pub fn transaction_fits(tx: &VersionedTransaction) -> (bool, usize) {
    let mut buf = Vec::with_capacity(PACKET_DATA_SIZE);
    if bincode::serialize_into(&mut buf, tx).is_err() {
        return (false, 0);
    }
    let size = buf.len();
    (size <= PACKET_DATA_SIZE - UDP_HEADROOM, size)
}

fn fallback_compute_units(instruction_count: usize) -> u32 {
    (200_000 + instruction_count as u32 * 20_000).min(MAX_COMPUTE_UNITS)
}

/// Simulated consumption plus 10%, or a conservative estimate when the
/// simulation is unavailable.
async fn simulate_compute_units(client: &RpcClient, instructions: &[Instruction], payer: &Pubkey) -> u32 {
    let message = legacy_message_with_cu(instructions, payer, 0, MAX_COMPUTE_UNITS, Hash::default());
    let tx = VersionedTransaction {
        signatures: vec![Signature::default(); message.header().num_required_signatures as usize],
        message,
    };
    let config = RpcSimulateTransactionConfig {
        sig_verify: false,
        replace_recent_blockhash: true,
        commitment: Some(CommitmentConfig::processed()),
        ..Default::default()
    };

    match client.simulate_transaction_with_config(&tx, config).await {
        Ok(result) => match result.value.units_consumed {
            Some(units) => ((units as f64 * 1.1) as u32).min(MAX_COMPUTE_UNITS),
            None => fallback_compute_units(instructions.len()),
        },
        Err(e) => {
            debug!(error = %e, "compute unit simulation failed, using estimate");
            fallback_compute_units(instructions.len())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintInfo {
    pub token_program: Pubkey,
    pub decimals: u8,
}

/// Owning program and decimals of a mint. Works for SPL Token and Token-2022.
pub async fn fetch_mint(client: &RpcClient, mint: &Pubkey) -> DistributionResult<MintInfo> {
    let account = client.get_account(mint).await.map_err(rpc_error)?;
    if account.owner != spl_token::id() && account.owner != spl_token_2022::id() {
        return Err(DistributionError::Config(format!(
            "{} is owned by {}, not a token program",
            mint, account.owner
        )));
    }
    let state = StateWithExtensions::<Mint>::unpack(&account.data)
        .map_err(|e| DistributionError::Config(format!("{} is not a mint: {}", mint, e)))?;
    Ok(MintInfo {
        token_program: account.owner,
        decimals: state.base.decimals,
    })
}

/// Balance of the distributor's token account. The account must belong to
/// the same program and mint as the distribution token.
pub async fn fetch_source_balance(
    client: &RpcClient,
    source: &Pubkey,
    mint: &Pubkey,
    token_program: &Pubkey,
) -> DistributionResult<u64> {
    let account = client.get_account(source).await.map_err(rpc_error)?;
    if account.owner != *token_program {
        return Err(DistributionError::Config(format!(
            "source account {} is owned by {} but the mint uses {}",
            source, account.owner, token_program
        )));
    }
    let state = StateWithExtensions::<TokenAccount>::unpack(&account.data)
        .map_err(|e| DistributionError::Config(format!("{} is not a token account: {}", source, e)))?;
    if state.base.mint != *mint {
        return Err(DistributionError::Config(format!(
            "source account {} holds mint {}, expected {}",
            source, state.base.mint, mint
        )));
    }
    Ok(state.base.amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DistributionConfig, dispatch::Dispatcher};
    use solana_client::{client_error::ClientErrorKind, rpc_request::RpcError};
    use solana_sdk::signature::Keypair;
    use solana_transaction_status::TransactionConfirmationStatus;
    use std::{
        collections::{HashSet, VecDeque},
        sync::{
            atomic::{AtomicU32, AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
        time::Instant,
    };

    #[test]
    fn test_retry_after_extraction() {
        assert_eq!(extract_retry_after("HTTP 429 Too Many Requests Retry-After: 7 seconds"), Some(7));
        assert_eq!(extract_retry_after("Retry-After:12"), Some(12));
        assert_eq!(extract_retry_after("connection reset"), None);
    }

    #[test]
    fn test_rate_limit_wait_only_for_transient_rate_errors() {
        let limited = SubmitError::Transient("429 rate limited, Retry-After: 3".into());
        assert_eq!(rate_limit_wait(&limited), Some(Duration::from_secs(3)));
        let rejected = SubmitError::Rejected("429 Retry-After: 3".into());
        assert_eq!(rate_limit_wait(&rejected), None);
    }

    #[test]
    fn test_client_error_classification() {
        let blockhash: ClientError = ClientErrorKind::TransactionError(TransactionError::BlockhashNotFound).into();
        assert!(classify_client_error(blockhash).is_retryable());

        let funds: ClientError = ClientErrorKind::TransactionError(TransactionError::InsufficientFundsForFee).into();
        assert!(!classify_client_error(funds).is_retryable());

        let transport: ClientError = ClientErrorKind::RpcError(RpcError::ForUser("node is behind".into())).into();
        assert!(classify_client_error(transport).is_retryable());

        let duplicate: ClientError = ClientErrorKind::TransactionError(TransactionError::AlreadyProcessed).into();
        assert!(is_already_processed(&duplicate));
        assert!(classify_client_error(duplicate).is_retryable());
    }

    #[test]
    fn test_compute_budget_prefix() {
        let payer = Pubkey::new_unique();
        let ix = spl_token_2022::instruction::transfer_checked(
            &spl_token::id(),
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            &payer,
            &[],
            1,
            6,
        )
        .unwrap();
        let message = legacy_message_with_cu(&[ix], &payer, 1000, 250_000, Hash::default());
        let VersionedMessage::Legacy(legacy) = message else {
            panic!("expected a legacy message");
        };
        assert_eq!(legacy.instructions.len(), 3);
        assert_eq!(legacy.account_keys[0], payer);
    }

    #[test]
    fn test_transaction_size_check() {
        let payer = Keypair::new();
        let small = legacy_message_with_cu(&[], &payer.pubkey(), 1000, 200_000, Hash::default());
        let tx = VersionedTransaction::try_new(small, &[&payer]).unwrap();
        let (fits, size) = transaction_fits(&tx);
        assert!(fits);
        assert!(size > 0);

        // 40 distinct transfers cannot fit in one packet
        let many: Vec<Instruction> = (0..40)
            .map(|_| {
                spl_token_2022::instruction::transfer_checked(
                    &spl_token::id(),
                    &Pubkey::new_unique(),
                    &Pubkey::new_unique(),
                    &Pubkey::new_unique(),
                    &payer.pubkey(),
                    &[],
                    1,
                    6,
                )
                .unwrap()
            })
            .collect();
        let big = legacy_message_with_cu(&many, &payer.pubkey(), 1000, 200_000, Hash::default());
        let tx = VersionedTransaction::try_new(big, &[&payer]).unwrap();
        assert!(!transaction_fits(&tx).0);
    }

    #[test]
    fn test_fallback_compute_units_capped() {
        assert_eq!(fallback_compute_units(3), 260_000);
        assert_eq!(fallback_compute_units(1_000), MAX_COMPUTE_UNITS);
    }

    #[test]
    fn test_signature_state_from_status() {
        let status = |err: Option<TransactionError>, level| TransactionStatus {
            slot: 1,
            confirmations: Some(1),
            status: match &err {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            },
            err,
            confirmation_status: Some(level),
        };
        assert_eq!(SignatureState::from(None), SignatureState::Unknown);
        assert_eq!(
            SignatureState::from(Some(status(None, TransactionConfirmationStatus::Processed))),
            SignatureState::Processed
        );
        assert_eq!(
            SignatureState::from(Some(status(None, TransactionConfirmationStatus::Confirmed))),
            SignatureState::Confirmed
        );
        assert_eq!(
            SignatureState::from(Some(status(
                Some(TransactionError::AccountNotFound),
                TransactionConfirmationStatus::Confirmed
            ))),
            SignatureState::Failed(TransactionError::AccountNotFound)
        );
    }

    #[derive(Debug, Clone, Copy)]
    enum Delivery {
        Land,
        /// Lands, but the reply is lost and the client sees a transport error.
        LandNoReply,
        /// Never reaches a leader.
        Lose,
    }

    #[derive(Default)]
    struct FakeCluster {
        deliveries: StdMutex<VecDeque<Delivery>>,
        sent: StdMutex<Vec<VersionedTransaction>>,
        landed: StdMutex<HashSet<Signature>>,
        expired: StdMutex<HashSet<Hash>>,
        /// Status lookups that miss a landed signature.
        status_lag: AtomicUsize,
        simulations: AtomicU32,
    }

    impl FakeCluster {
        fn new(deliveries: impl IntoIterator<Item = Delivery>) -> Self {
            Self {
                deliveries: StdMutex::new(deliveries.into_iter().collect()),
                ..Default::default()
            }
        }

        fn sent_signatures(&self) -> Vec<Signature> {
            self.sent.lock().unwrap().iter().map(|tx| tx.signatures[0]).collect()
        }

        fn sent_blockhash(&self, i: usize) -> Hash {
            *self.sent.lock().unwrap()[i].message.recent_blockhash()
        }
    }

    fn transport_error() -> ClientError {
        ClientErrorKind::RpcError(RpcError::ForUser("connection reset by peer".into())).into()
    }

    #[async_trait]
    impl SubmissionRpc for FakeCluster {
        async fn latest_blockhash(&self) -> Result<Hash, ClientError> {
            Ok(Hash::new_unique())
        }

        async fn blockhash_is_valid(&self, blockhash: &Hash) -> Result<bool, ClientError> {
            Ok(!self.expired.lock().unwrap().contains(blockhash))
        }

        async fn compute_unit_limit(&self, _instructions: &[Instruction], _payer: &Pubkey) -> u32 {
            // drifts between calls, as it does once a first copy created the accounts
            200_000 + self.simulations.fetch_add(1, Ordering::SeqCst) * 1_000
        }

        async fn send(&self, tx: &VersionedTransaction) -> Result<Signature, ClientError> {
            let signature = tx.signatures[0];
            self.sent.lock().unwrap().push(tx.clone());
            if self.landed.lock().unwrap().contains(&signature) {
                return Err(ClientErrorKind::TransactionError(TransactionError::AlreadyProcessed).into());
            }
            let delivery = self.deliveries.lock().unwrap().pop_front().unwrap_or(Delivery::Land);
            match delivery {
                Delivery::Land => {
                    self.landed.lock().unwrap().insert(signature);
                    Ok(signature)
                }
                Delivery::LandNoReply => {
                    self.landed.lock().unwrap().insert(signature);
                    Err(transport_error())
                }
                Delivery::Lose => Err(transport_error()),
            }
        }

        async fn signature_state(&self, signature: &Signature, _search_history: bool) -> Result<SignatureState, ClientError> {
            let lagging = self
                .status_lag
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !lagging && self.landed.lock().unwrap().contains(signature) {
                Ok(SignatureState::Confirmed)
            } else {
                Ok(SignatureState::Unknown)
            }
        }

        async fn slot(&self) -> Result<u64, ClientError> {
            Ok(0)
        }
    }

    fn submitter(cluster: Arc<FakeCluster>) -> RpcSubmitter<FakeCluster> {
        let owner = Arc::new(Keypair::new());
        RpcSubmitter::new(cluster, owner.clone(), owner, 1_000).with_poll_interval(Duration::from_millis(1))
    }

    fn batch(id: usize) -> TransferBatch {
        TransferBatch {
            id,
            entries: vec![],
            instructions: vec![],
            blockhash: Hash::new_unique(),
            built_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_lost_reply_after_landing_is_not_sent_again() {
        let cluster = Arc::new(FakeCluster::new([Delivery::LandNoReply]));
        let submitter = submitter(cluster.clone());
        let batch = batch(0);

        let first = submitter.submit(&batch).await.unwrap_err();
        assert!(first.is_retryable());

        let signature = submitter.submit(&batch).await.unwrap();
        assert_eq!(cluster.sent_signatures(), vec![signature]);
        assert_eq!(cluster.simulations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_processed_resend_confirms() {
        let cluster = Arc::new(FakeCluster::new([Delivery::LandNoReply]));
        // the first status lookup has not caught up with the landed copy
        cluster.status_lag.store(1, Ordering::SeqCst);
        let submitter = submitter(cluster.clone());
        let batch = batch(0);

        assert!(submitter.submit(&batch).await.is_err());
        let signature = submitter.submit(&batch).await.unwrap();

        assert_eq!(cluster.sent_signatures(), vec![signature, signature]);
    }

    #[tokio::test]
    async fn test_same_copy_resent_until_blockhash_expires() {
        let cluster = Arc::new(FakeCluster::new([Delivery::Lose, Delivery::Lose]));
        let submitter = submitter(cluster.clone());
        let batch = batch(3);

        assert!(submitter.submit(&batch).await.is_err());
        assert!(submitter.submit(&batch).await.is_err());
        let sent = cluster.sent_signatures();
        assert_eq!(sent[0], sent[1]);
        assert_eq!(cluster.sent_blockhash(0), batch.blockhash);

        cluster.expired.lock().unwrap().insert(batch.blockhash);
        let signature = submitter.submit(&batch).await.unwrap();

        assert_ne!(signature, sent[0]);
        assert_eq!(cluster.sent_signatures().len(), 3);
        assert_ne!(cluster.sent_blockhash(2), batch.blockhash);
    }

    #[tokio::test]
    async fn test_dispatch_counts_batch_whose_reply_was_lost() {
        let cluster = Arc::new(FakeCluster::new([Delivery::LandNoReply, Delivery::Land]));
        let endpoint: Arc<dyn SubmissionEndpoint> = Arc::new(submitter(cluster.clone()));
        let config = DistributionConfig {
            concurrency: 1,
            retry_backoff_ms: 1,
            rate_limit: 0,
            ..Default::default()
        };

        let report = Dispatcher::new(endpoint, &config).dispatch(vec![batch(0), batch(1)]).await;

        assert_eq!(report.confirmed().count(), 2);
        assert_eq!(report.results[0].attempts, 2);
        assert_eq!(cluster.sent_signatures().len(), 2);
    }
}
