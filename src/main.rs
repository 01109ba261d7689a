use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::Keypair,
    signer::Signer,
};
use spl_reward_dropper::{
    allocation::distributable_pool,
    batch::{SplTransferInstructions, TransferAccounts},
    dispatch::SubmissionEndpoint,
    history::{DistributionHistory, HistoryStore, JsonHistoryStore},
    rpc::{self, RpcAccountExistence, RpcFreshness, RpcSubmitter},
    snapshot::{CsvSnapshotSource, SnapshotChain},
    spell::{SpellBonusLookup, SpellProgram},
    weights::{BonusStateLookup, NoBonus},
    Collaborators, DistributionConfig, DistributionEngine, DistributionError, DistributionPlan,
    DistributionTarget, RunSummary,
};
use std::{
    convert::TryFrom,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;
const BASE_FEE_SOL: f64 = 0.000005;
/// Rent-exempt minimum of a plain token account.
const TOKEN_ACCOUNT_RENT_SOL: f64 = 0.00203928;
/// Compute units assumed per transaction when estimating the priority fee.
const ESTIMATED_CU_PER_TX: f64 = 200_000.0;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Distribute a token pool to holders of a snapshot mint
    Distribute(DistributeArgs),
    /// Show the recorded distribution history
    History(HistoryArgs),
    /// Generate a synthetic holder snapshot CSV
    GenerateSnapshot(GenerateArgs),
}

#[derive(Parser)]
struct DistributeArgs {
    /// Mint whose holders are rewarded
    #[clap(long)]
    snapshot_mint: String,

    /// Mint being distributed
    #[clap(long)]
    mint: String,

    /// Source token account holding the pool
    #[clap(long)]
    from: String,

    /// Owner keypair path (authority of the source account)
    #[clap(long)]
    owner: PathBuf,

    /// Fee payer keypair path (defaults to the owner)
    #[clap(long)]
    fee_payer: Option<PathBuf>,

    /// RPC URL
    #[clap(long)]
    url: String,

    /// TOML file with distribution settings
    #[clap(long)]
    config: Option<PathBuf>,

    /// Read holders from an owner,amount CSV instead of the chain
    #[clap(long)]
    snapshot_csv: Option<PathBuf>,

    /// Spell program used for bonus multipliers
    #[clap(long)]
    spell_program: Option<String>,

    #[clap(long, default_value = "distribution-history.json")]
    history_file: PathBuf,

    /// Rate limit (submissions per second, 0 disables)
    #[clap(long)]
    rate_limit: Option<u32>,

    /// Compute unit price in microlamports
    #[clap(long)]
    priority_fee: Option<u64>,

    /// Batches in flight at once
    #[clap(long)]
    concurrency: Option<usize>,

    /// Perform a dry run
    #[clap(long)]
    dry_run: bool,

    /// Skip confirmation prompt
    #[clap(long)]
    yes: bool,

    /// Debug logging
    #[clap(long)]
    verbose: bool,
}

#[derive(Parser)]
struct HistoryArgs {
    #[clap(long, default_value = "distribution-history.json")]
    history_file: PathBuf,
}

#[derive(Parser)]
struct GenerateArgs {
    /// Number of holders
    #[clap(long)]
    count: usize,

    /// Balance per holder (in base units)
    #[clap(long)]
    amount: u64,

    /// Output CSV file
    #[clap(long)]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Commands::Distribute(args) if args.verbose);
    init_tracing(verbose);

    match cli.command {
        Commands::Distribute(args) => distribute(args).await,
        Commands::History(args) => show_history(args),
        Commands::GenerateSnapshot(args) => generate_snapshot(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn generate_snapshot(args: GenerateArgs) -> Result<()> {
    println!("Generating {} holders with {} tokens each...", args.count, args.amount);

    let mut writer = csv::Writer::from_path(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    writer.write_record(["owner", "amount"])?;

    // fresh keypairs, so every generated owner is a valid on-curve wallet
    for _ in 0..args.count {
        let owner = Keypair::new().pubkey();
        writer.write_record([owner.to_string(), args.amount.to_string()])?;
    }

    writer.flush()?;
    println!("Generated {} holders in {}", args.count, args.output.display());
    Ok(())
}

fn show_history(args: HistoryArgs) -> Result<()> {
    let store = JsonHistoryStore::new(&args.history_file);
    let history = store
        .load()
        .with_context(|| format!("Failed to read history from {}", args.history_file.display()))?;
    print_history(&history);
    Ok(())
}

fn print_history(history: &DistributionHistory) {
    println!("\n=== DISTRIBUTION HISTORY ===");
    println!("Total distributed (all time): {} base units", history.total_distributed_all_time);
    println!("Runs: {}", history.runs.len());
    for (i, run) in history.runs.iter().enumerate() {
        println!(
            "\n#{} {}  {} -> {}",
            i + 1,
            run.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            run.snapshot_mint,
            run.distribution_mint
        );
        println!(
            "   Distributed: {} of {} allocated | recipients: {} | failed: {}",
            run.total_amount_distributed, run.allocated_amount, run.recipient_count, run.failed_recipient_count
        );
        println!(
            "   Batches: {} confirmed of {}",
            run.confirmed_batches(),
            run.batch_results.len()
        );
    }
}

async fn distribute(args: DistributeArgs) -> Result<()> {
    println!("\n🚀 Starting reward distribution...");

    let mut config = match &args.config {
        Some(path) => DistributionConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DistributionConfig::default(),
    };
    if let Some(rate_limit) = args.rate_limit {
        config.rate_limit = rate_limit;
    }
    if let Some(priority_fee) = args.priority_fee {
        config.priority_fee = priority_fee;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    config.validate()?;

    let owner = Arc::new(load_keypair(&args.owner)?);
    let fee_payer = match &args.fee_payer {
        Some(path) => Arc::new(load_keypair(path)?),
        None => owner.clone(),
    };

    let snapshot_mint = parse_pubkey(&args.snapshot_mint, "--snapshot-mint")?;
    let mint = parse_pubkey(&args.mint, "--mint")?;
    let source = parse_pubkey(&args.from, "--from")?;

    let client = Arc::new(RpcClient::new_with_commitment(
        args.url.clone(),
        CommitmentConfig::confirmed(),
    ));

    let mint_info = rpc::fetch_mint(&client, &mint).await?;
    let decimals = mint_info.decimals;
    println!(
        "Token mint: {} (decimals: {}, program: {})",
        mint, decimals, mint_info.token_program
    );

    let source_balance = rpc::fetch_source_balance(&client, &source, &mint, &mint_info.token_program).await?;
    println!("Source balance: {} tokens", amount_to_ui(source_balance, decimals));

    let Some(pool) = distributable_pool(source_balance, config.reserve_amount, config.min_distribution_amount)
    else {
        println!(
            "Balance does not exceed the minimum of {} tokens (reserve {}). Skipping this run.",
            amount_to_ui(config.min_distribution_amount, decimals),
            amount_to_ui(config.reserve_amount, decimals)
        );
        return Ok(());
    };
    println!("Distributable pool: {} tokens", amount_to_ui(pool, decimals));

    let fee_payer_balance = client.get_balance(&fee_payer.pubkey()).await?;
    println!("Fee payer balance: {} SOL", fee_payer_balance as f64 / LAMPORTS_PER_SOL);
    if fee_payer_balance < 100_000_000 {
        println!("⚠️  Warning: Low SOL balance for fees!");
    }

    let snapshot = match &args.snapshot_csv {
        Some(path) => SnapshotChain::new(vec![Box::new(CsvSnapshotSource::new(path))]),
        None => SnapshotChain::token_programs(client.clone()),
    };

    // loaded once for the whole run, dropped with the engine
    let bonus: Box<dyn BonusStateLookup> = match &args.spell_program {
        Some(id) => {
            let program_id = parse_pubkey(id, "--spell-program")?;
            let program = Arc::new(SpellProgram::load(&client, program_id).await?);
            Box::new(SpellBonusLookup::new(client.clone(), program, Utc::now().timestamp()))
        }
        None => Box::new(NoBonus),
    };

    let existence = RpcAccountExistence::new(client.clone());
    let freshness = RpcFreshness::new(client.clone());
    let instructions = SplTransferInstructions::new(mint, mint_info.token_program, decimals);
    let endpoint: Arc<dyn SubmissionEndpoint> = Arc::new(RpcSubmitter::new(
        client.clone(),
        fee_payer.clone(),
        owner.clone(),
        config.priority_fee,
    ));
    let history = JsonHistoryStore::new(&args.history_file);
    history
        .load()
        .with_context(|| format!("Failed to read history from {}", args.history_file.display()))?;

    let target = DistributionTarget {
        snapshot_mint,
        distribution_mint: mint,
        accounts: TransferAccounts {
            source,
            authority: owner.pubkey(),
            payer: fee_payer.pubkey(),
        },
    };
    let collaborators = Collaborators {
        snapshot: &snapshot,
        bonus: bonus.as_ref(),
        existence: &existence,
        freshness: &freshness,
        instructions: &instructions,
        endpoint,
        history: &history,
    };
    let engine = DistributionEngine::new(config, target, collaborators)?.with_progress(true);
    let priority_fee = engine.config().priority_fee;

    let plan = engine.plan(pool).await?;
    print_plan(&plan, decimals);

    if plan.is_empty() {
        println!("No eligible recipients. Nothing to distribute.");
        return Ok(());
    }

    if args.dry_run {
        dry_run_summary(&plan, decimals, priority_fee);
        return Ok(());
    }

    if !args.yes {
        println!("\nReady to distribute? [y/N] ");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    } else {
        println!("\nProceeding with distribution (--yes flag set)");
    }

    match engine.execute(plan).await {
        Ok(summary) => {
            print_summary(&summary, decimals);
            Ok(())
        }
        Err(DistributionError::HistoryPersist { run, message }) => {
            eprintln!("\n‼️  Transfers were sent but the history file was NOT updated: {}", message);
            eprintln!(
                "   {} tokens landed in {} confirmed batches. Signatures:",
                amount_to_ui(run.total_amount_distributed, decimals),
                run.confirmed_batches()
            );
            for signature in run.signatures() {
                eprintln!("   {}", signature);
            }
            Err(anyhow!(
                "history persistence failed after {} confirmed batches",
                run.confirmed_batches()
            ))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_plan(plan: &DistributionPlan, decimals: u8) {
    let counts = &plan.counts;
    println!("\n=== DISTRIBUTION PLAN ===");
    println!("Snapshot source: {} ({} accounts)", plan.snapshot_source, counts.snapshot_accounts);
    println!(
        "Excluded: {} zero balance, {} blacklisted, {} pool-owned; {} accounts merged",
        counts.zero_balance, counts.blacklisted, counts.pool_owned, counts.merged_accounts
    );
    println!(
        "Eligible holders: {} ({} with bonus, {} lookup failures, {} malformed)",
        counts.eligible_holders, counts.with_bonus, counts.lookup_failures, counts.malformed
    );
    println!(
        "Dropped: {} below dust cutoff, {} off-curve, {} excluded",
        counts.below_cutoff, counts.off_curve, counts.excluded_recipients
    );
    println!("Total points: {:.2}", plan.total_points);
    println!("Recipients: {}", plan.recipients.len());
    println!(
        "Total tokens: {} of {} pool",
        amount_to_ui(plan.total_payout(), decimals),
        amount_to_ui(plan.pool, decimals)
    );
    println!(
        "Transactions: {} ({} token accounts to create)",
        plan.batches.len(),
        plan.account_creations()
    );
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CostEstimate {
    tx_fee: f64,
    transactions: usize,
    account_creations: usize,
}

impl CostEstimate {
    fn new(transactions: usize, account_creations: usize, priority_fee: u64) -> Self {
        let priority_fee_sol = (priority_fee as f64 * ESTIMATED_CU_PER_TX) / 1_000_000.0 / LAMPORTS_PER_SOL;
        Self {
            tx_fee: BASE_FEE_SOL + priority_fee_sol,
            transactions,
            account_creations,
        }
    }

    fn rent(&self) -> f64 {
        self.account_creations as f64 * TOKEN_ACCOUNT_RENT_SOL
    }

    fn fees(&self) -> f64 {
        self.transactions as f64 * self.tx_fee
    }

    fn total(&self) -> f64 {
        self.rent() + self.fees()
    }
}

fn dry_run_summary(plan: &DistributionPlan, decimals: u8, priority_fee: u64) {
    println!("\n=== DRY RUN SUMMARY ===");
    for recipient in &plan.recipients {
        println!(
            "  {}  {:>16}  ({:.4}% | {:.2} pts | x{:.2})",
            recipient.owner,
            amount_to_ui(recipient.payout, decimals),
            recipient.share_fraction * 100.0,
            recipient.points,
            recipient.multiplier
        );
    }

    let estimate = CostEstimate::new(plan.batches.len(), plan.account_creations(), priority_fee);
    println!("\n💰 Estimated SOL costs:");
    if estimate.account_creations > 0 {
        println!(
            "  Token account rent: {} × {} = {:.4} SOL",
            estimate.account_creations,
            TOKEN_ACCOUNT_RENT_SOL,
            estimate.rent()
        );
    }
    println!(
        "  Transactions: {} × {:.6} = {:.4} SOL",
        estimate.transactions,
        estimate.tx_fee,
        estimate.fees()
    );
    println!("\n  TOTAL ESTIMATED: {:.4} SOL", estimate.total());
    println!("\n  ⚠️  Add 10-20% buffer for network conditions");
}

fn print_summary(summary: &RunSummary, decimals: u8) {
    let report = &summary.report;
    let confirmed = report.confirmed().count();
    let failed = report.results.len() - confirmed;

    println!("\n✅ Distribution complete!");
    println!("Batches: {} confirmed, {} failed", confirmed, failed);
    if let Some(run) = &summary.run {
        println!(
            "Distributed: {} tokens to {} recipients",
            amount_to_ui(run.total_amount_distributed, decimals),
            run.recipient_count
        );
        if run.failed_recipient_count > 0 {
            println!(
                "⚠️  {} recipients in failed batches were not paid ({} tokens)",
                run.failed_recipient_count,
                amount_to_ui(run.allocated_amount.saturating_sub(run.total_amount_distributed), decimals)
            );
        }
    }
    if let Some(total) = summary.total_distributed_all_time {
        println!("All-time distributed: {} tokens", amount_to_ui(total, decimals));
    }
}

fn load_keypair(path: &Path) -> Result<Keypair> {
    let keypair_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read keypair from {}", path.display()))?;

    let keypair_bytes: Vec<u8> = serde_json::from_str(&keypair_str)
        .with_context(|| format!("Failed to parse keypair JSON from {}", path.display()))?;

    Keypair::from_bytes(keypair_bytes.as_slice())
        .with_context(|| format!("Invalid keypair format in {}", path.display()))
}

fn parse_pubkey(value: &str, flag: &str) -> Result<Pubkey> {
    Pubkey::from_str(value).with_context(|| format!("Invalid address for {}: {}", flag, value))
}

fn amount_to_ui(amount: u64, decimals: u8) -> f64 {
    amount as f64 / 10_f64.powi(decimals as i32)
}
