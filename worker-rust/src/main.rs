mod client;
mod config;
mod trainer;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use ledgerfl_protocol::ledger::EvmLedger;
use ledgerfl_protocol::{Dataset, LedgerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::client::{CoordinatorApi, CoordinatorClient};
use crate::trainer::LogisticTrainer;
use crate::worker::Participant;

#[derive(Parser)]
#[command(name = "ledgerfl-participant", about = "Federated-learning participant agent")]
struct Cli {
    /// Coordinator base URL
    #[arg(long, default_value = "http://127.0.0.1:8000", env = "LEDGERFL_COORDINATOR")]
    coordinator: String,

    /// Wallet address, used as the participant id
    #[arg(long, env = "LEDGERFL_WALLET_ADDRESS")]
    wallet: String,

    /// Wallet key (signs submitUpdate)
    #[arg(long, env = "LEDGERFL_PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Local training CSV
    #[arg(long, default_value = "datasets/client_A.csv", env = "LEDGERFL_DATASET")]
    dataset: PathBuf,

    /// Label column of the local CSV
    #[arg(long, default_value = "label", env = "LEDGERFL_LABEL_COLUMN")]
    label_column: String,

    /// Comma-separated columns dropped before training
    #[arg(long, value_delimiter = ',', env = "LEDGERFL_DROP_COLUMNS")]
    drop_columns: Vec<String>,

    /// Use only the first N rows of the dataset
    #[arg(long, env = "LEDGERFL_MAX_ROWS")]
    max_rows: Option<usize>,

    /// Where local artifacts are written before upload
    #[arg(long, default_value = "./participant-data", env = "LEDGERFL_WORK_DIR")]
    work_dir: PathBuf,

    /// Poll interval in seconds
    #[arg(long, default_value = "2", env = "LEDGERFL_POLL_SECS")]
    poll_interval: u64,

    /// HTTP timeout in seconds
    #[arg(long, default_value = "30", env = "LEDGERFL_HTTP_TIMEOUT")]
    http_timeout: u64,

    /// Gradient descent epochs per round
    #[arg(long, default_value = "1000", env = "LEDGERFL_EPOCHS")]
    epochs: usize,

    #[arg(long, default_value = "0.1", env = "LEDGERFL_LEARNING_RATE")]
    learning_rate: f64,

    /// Fixed seed for the local train/test split
    #[arg(long, env = "LEDGERFL_SEED")]
    seed: Option<u64>,

    /// Ledger JSON-RPC endpoint
    #[arg(long, default_value = "http://127.0.0.1:8545", env = "LEDGERFL_RPC_URL")]
    rpc_url: String,

    /// Federated-learning contract address
    #[arg(long, env = "LEDGERFL_CONTRACT")]
    contract: String,

    /// Per-call ledger timeout in seconds
    #[arg(long, default_value = "15", env = "LEDGERFL_CALL_TIMEOUT")]
    call_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::Config {
        coordinator_url: cli.coordinator,
        participant: cli.wallet,
        dataset: cli.dataset,
        label_column: cli.label_column,
        drop_columns: cli.drop_columns,
        max_rows: cli.max_rows,
        work_dir: cli.work_dir,
        poll_interval: Duration::from_secs(cli.poll_interval),
        http_timeout: Duration::from_secs(cli.http_timeout),
        epochs: cli.epochs,
        learning_rate: cli.learning_rate,
        seed: cli.seed,
        ledger: LedgerConfig {
            rpc_url: cli.rpc_url,
            contract_address: cli.contract,
            private_key: cli.private_key,
            call_timeout: Duration::from_secs(cli.call_timeout),
            ..LedgerConfig::default()
        },
    };
    tracing::info!(participant = %cfg.participant, coordinator = %cfg.coordinator_url, "Starting participant");

    let mut dataset = Dataset::from_csv(&cfg.dataset, &cfg.label_column, &cfg.drop_columns)
        .await
        .with_context(|| format!("loading {}", cfg.dataset.display()))?;
    if let Some(max) = cfg.max_rows {
        let keep: Vec<usize> = (0..dataset.len().min(max)).collect();
        dataset = dataset.subset(&keep);
    }
    dataset.standardize();
    tracing::info!(rows = dataset.len(), features = dataset.n_features(), classes = ?dataset.classes(), "Local dataset loaded");

    let ledger = EvmLedger::connect(cfg.ledger.clone()).await.context("connecting to the ledger")?;
    let coordinator: Arc<dyn CoordinatorApi> = Arc::new(CoordinatorClient::new(&cfg)?);
    let participant = Participant {
        id: cfg.participant.clone(),
        ledger: Arc::new(ledger),
        coordinator: coordinator.clone(),
        trainer: Box::new(LogisticTrainer {
            epochs: cfg.epochs,
            learning_rate: cfg.learning_rate,
            seed: cfg.seed,
            ..LogisticTrainer::default()
        }),
        dataset,
        work_dir: cfg.work_dir.clone(),
    };

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Main loop: wait for a new active round, contribute once, repeat
    let mut last_round: Option<u64> = None;
    loop {
        if *shutdown_rx.borrow() {
            tracing::info!("Shutting down gracefully");
            break;
        }

        match coordinator.status().await {
            Ok(status) if status.training_active && last_round.map_or(true, |r| status.current_round > r) => {
                match participant.train_and_submit(status.current_round).await {
                    Ok(outcome) if outcome.is_settled() => {
                        tracing::info!(round = status.current_round, ?outcome, "Round handled");
                        last_round = Some(status.current_round);
                    }
                    Ok(outcome) => tracing::info!(round = status.current_round, ?outcome, "Round not settled, retrying"),
                    Err(e) => tracing::error!(round = status.current_round, "Round failed: {e:#}"),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Coordinator unreachable: {e:#}, retrying"),
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.poll_interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    tracing::info!("Participant shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
