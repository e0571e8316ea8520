//! TradeLeague CLI
//!
//! Wires the ledger, chain client, store and orchestrator together and runs
//! one command against them.
//!
//! Usage:
//!   cargo run -- status
//!   cargo run -- join-league --league-id 42 --name "Summer Cup" --fee 30
//!   cargo run -- history --kind vault
//!   cargo run -- watch --league 42 --reconnect

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradeleague_backend::chain::{
    ChainClient, FullnodeChainClient, HttpSigningProvider, SimulatedChainClient,
};
use tradeleague_backend::ledger::BalanceLedger;
use tradeleague_backend::models::{ChainMode, Config, Transaction, TransactionKind};
use tradeleague_backend::orchestrator::{
    EventRecord, OrchestratorConfig, Resolution, TransactionEvent, TransactionOrchestrator,
};
use tradeleague_backend::relay::{ReconnectPolicy, UpdateKind, UpdateRelay};
use tradeleague_backend::store::TransactionStore;

#[derive(Parser, Debug)]
#[command(name = "tradeleague")]
#[command(about = "League, vault and prediction transactions against the testnet")]
struct Args {
    /// Override TRADELEAGUE_DB_PATH
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Balance, allocation and pending transactions
    Status,
    JoinLeague {
        #[arg(long)]
        league_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        fee: Decimal,
    },
    FollowVault {
        #[arg(long)]
        vault_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        amount: Decimal,
    },
    PlacePrediction {
        #[arg(long)]
        market_id: String,
        #[arg(long)]
        question: String,
        #[arg(long, default_value_t = 0)]
        outcome: u32,
        #[arg(long)]
        amount: Decimal,
    },
    /// Transaction history, most recent first
    History {
        /// league | vault | prediction
        #[arg(long)]
        kind: Option<String>,
    },
    /// Poll the chain for transactions left pending
    Reconcile,
    /// Settle a transaction reconciliation could not resolve
    Resolve {
        #[arg(long)]
        id: String,
        /// Chain hash confirming success; omit to mark failed
        #[arg(long)]
        hash: Option<String>,
        #[arg(long, default_value = "resolved as failed by operator")]
        reason: String,
    },
    /// Delete the transaction history (balance is kept)
    Clear,
    /// Stream leaderboard/vault/market updates as JSON lines
    Watch {
        #[arg(long)]
        league: Vec<String>,
        #[arg(long)]
        vault: Vec<String>,
        #[arg(long)]
        market: Vec<String>,
        /// Reconnect with exponential backoff
        #[arg(long, default_value = "false")]
        reconnect: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(db) = args.db {
        config.database_path = db;
    }

    match args.command {
        Command::Watch {
            league,
            vault,
            market,
            reconnect,
        } => watch(&config, league, vault, market, reconnect).await,
        command => run(&config, command).await,
    }
}

async fn run(config: &Config, command: Command) -> Result<()> {
    let orchestrator = start_service(config).await?;

    match command {
        Command::Status => print_status(&orchestrator),
        Command::JoinLeague {
            league_id,
            name,
            fee,
        } => {
            let events = orchestrator.subscribe();
            let result = orchestrator.join_league(&league_id, &name, fee).await;
            report(result, events)?;
        }
        Command::FollowVault {
            vault_id,
            name,
            amount,
        } => {
            let events = orchestrator.subscribe();
            let result = orchestrator.follow_vault(&vault_id, &name, amount).await;
            report(result, events)?;
        }
        Command::PlacePrediction {
            market_id,
            question,
            outcome,
            amount,
        } => {
            let events = orchestrator.subscribe();
            let result = orchestrator
                .place_prediction(&market_id, &question, outcome, amount)
                .await;
            report(result, events)?;
        }
        Command::History { kind } => {
            let transactions = match kind {
                Some(k) => {
                    let Some(kind) = TransactionKind::from_str(&k) else {
                        bail!("unknown kind '{}' (league | vault | prediction)", k);
                    };
                    orchestrator.transactions_of_kind(kind).await
                }
                None => orchestrator.transactions().await,
            };
            print_transactions(&transactions);
        }
        Command::Reconcile => {
            let report = orchestrator.reconcile_pending().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Resolve { id, hash, reason } => {
            let resolution = match hash {
                Some(chain_hash) => Resolution::Succeeded { chain_hash },
                None => Resolution::Failed { reason },
            };
            let tx = orchestrator.resolve_unknown(&id, resolution).await?;
            print_transactions(&[tx]);
            println!("Balance: {}", orchestrator.balance());
        }
        Command::Clear => {
            orchestrator.clear_history().await?;
            println!("History cleared. Balance: {}", orchestrator.balance());
        }
        Command::Watch { .. } => bail!("watch runs without the transaction service"),
    }

    Ok(())
}

/// Open the store, restore the ledger and reconcile anything left pending.
async fn start_service(config: &Config) -> Result<Arc<TransactionOrchestrator>> {
    let store = Arc::new(
        TransactionStore::open(&config.database_path)
            .with_context(|| format!("open store at {}", config.database_path))?,
    );

    let ledger = match store.load_balance().await? {
        Some(snapshot) => {
            info!(balance = %snapshot.balance, version = snapshot.version, "restored balance");
            BalanceLedger::from_snapshot(snapshot)
        }
        None => {
            let ledger = BalanceLedger::new(config.initial_balance);
            store.save_balance(&ledger.snapshot()).await?;
            info!(balance = %config.initial_balance, "initialized balance");
            ledger
        }
    };

    let chain = build_chain(config)?;

    let (orchestrator, report) = TransactionOrchestrator::start(
        Arc::new(ledger),
        chain,
        store,
        OrchestratorConfig::from_config(config),
    )
    .await?;

    if report.unknown() > 0 {
        warn!(
            unknown = report.unknown(),
            "some transactions could not be reconciled; see `tradeleague status`"
        );
    }

    Ok(orchestrator)
}

fn build_chain(config: &Config) -> Result<Arc<dyn ChainClient>> {
    let chain: Arc<dyn ChainClient> = match config.chain_mode {
        ChainMode::Simulated => {
            info!("chain client running in SIMULATED mode");
            Arc::new(SimulatedChainClient::default())
        }
        ChainMode::Fullnode => match &config.signer_url {
            Some(signer_url) => {
                info!(url = %config.fullnode_url, "chain client running against fullnode");
                let signer = Arc::new(HttpSigningProvider::new(
                    reqwest::Client::builder()
                        .timeout(Duration::from_secs(30))
                        .build()
                        .context("failed to build signer HTTP client")?,
                    signer_url.clone(),
                ));
                Arc::new(FullnodeChainClient::new(
                    &config.fullnode_url,
                    &config.module_address,
                    &config.wallet_address,
                    signer,
                )?)
            }
            None => {
                warn!(
                    "TRADELEAGUE_CHAIN_MODE=fullnode but TRADELEAGUE_SIGNER_URL not set; falling back to simulated"
                );
                Arc::new(SimulatedChainClient::default())
            }
        },
    };
    Ok(chain)
}

fn report(
    result: Result<Transaction, tradeleague_backend::TransactionError>,
    mut events: broadcast::Receiver<TransactionEvent>,
) -> Result<()> {
    while let Ok(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&EventRecord::now(&event))?);
    }

    match result {
        Ok(tx) => {
            print_transactions(&[tx.clone()]);
            if let Some(url) = tx.explorer_url() {
                println!("Explorer: {}", url);
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_status(orchestrator: &TransactionOrchestrator) {
    let allocation = orchestrator.allocation();

    println!("=== Balance ===");
    println!("Available: {}", orchestrator.balance());
    println!();
    println!("=== Allocation ===");
    for token in &allocation.tokens {
        println!(
            "{:<6} {:<20} {:>5}%  {:>12}",
            token.symbol, token.name, token.percentage, token.amount
        );
    }
    println!(
        "Committed: league {} | vault {} | prediction {}",
        allocation.committed.league, allocation.committed.vault, allocation.committed.prediction
    );
    println!();

    let pending = orchestrator.pending_transactions();
    println!("=== Pending ({}) ===", pending.len());
    print_transactions(&pending);
    for err in orchestrator.unresolved() {
        println!("  {}", err);
    }
}

fn print_transactions(transactions: &[Transaction]) {
    if transactions.is_empty() {
        println!("(none)");
        return;
    }
    for tx in transactions {
        println!(
            "{}  {:<16} {:>10}  {:<7}  {}  {}",
            tx.created_at.format("%Y-%m-%d %H:%M:%S"),
            tx.kind.as_str(),
            tx.amount,
            tx.status.as_str(),
            tx.id,
            tx.description
        );
        if let Some(reason) = &tx.failure_reason {
            println!("    reason: {}", reason);
        }
        if tx.has_hash() {
            println!("    hash:   {}", tx.chain_hash);
        }
    }
}

async fn watch(
    config: &Config,
    leagues: Vec<String>,
    vaults: Vec<String>,
    markets: Vec<String>,
    reconnect: bool,
) -> Result<()> {
    let policy = if reconnect {
        ReconnectPolicy::Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    } else {
        ReconnectPolicy::Never
    };

    let relay = UpdateRelay::spawn(config.stream_url.clone(), policy);
    for id in &leagues {
        relay.subscribe_league(id);
    }
    for id in &vaults {
        relay.subscribe_vault(id);
    }
    for id in &markets {
        relay.subscribe_market(id);
    }

    let [mut leaderboard, mut vault, mut market] = UpdateKind::ALL.map(|k| relay.observe(k));

    loop {
        let update = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                relay.disconnect();
                return Ok(());
            }
            u = leaderboard.recv() => u,
            u = vault.recv() => u,
            u = market.recv() => u,
        };

        match update {
            Ok(update) => println!("{}", serde_json::to_string(&update)?),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "watch output lagged")
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeleague_backend=info,tradeleague=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
