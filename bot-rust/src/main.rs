mod client;
mod config;
mod verifier;

use anyhow::{Context, Result};
use clap::Parser;
use ledgerfl_protocol::ledger::EvmLedger;
use ledgerfl_protocol::LedgerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::client::WebhookClient;
use crate::verifier::Verifier;

#[derive(Parser)]
#[command(name = "ledgerfl-verifier", about = "Pays verified federated-learning contributions")]
struct Cli {
    /// Coordinator base URL
    #[arg(long, default_value = "http://127.0.0.1:8000", env = "LEDGERFL_COORDINATOR")]
    coordinator: String,

    /// Bearer token for the coordinator webhook
    #[arg(long, env = "LEDGERFL_WEBHOOK_TOKEN")]
    webhook_token: Option<String>,

    /// Artifact directory written by the coordinator
    #[arg(long, default_value = "./coordinator-data/artifacts", env = "LEDGERFL_ARTIFACTS_DIR")]
    artifacts_dir: PathBuf,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "2000", env = "LEDGERFL_POLL_MS")]
    poll_ms: u64,

    /// Webhook delivery attempts per notification
    #[arg(long, default_value = "3", env = "LEDGERFL_NOTIFY_ATTEMPTS")]
    notify_attempts: u32,

    /// Fixed backoff between webhook attempts in milliseconds
    #[arg(long, default_value = "1000", env = "LEDGERFL_NOTIFY_BACKOFF_MS")]
    notify_backoff_ms: u64,

    /// HTTP timeout for webhook calls in seconds
    #[arg(long, default_value = "10", env = "LEDGERFL_HTTP_TIMEOUT")]
    http_timeout: u64,

    /// Reward paid per verified contribution, in wei
    #[arg(long, default_value = "10000000000000", env = "LEDGERFL_REWARD_WEI")]
    reward_wei: u128,

    /// Ledger JSON-RPC endpoint
    #[arg(long, default_value = "http://127.0.0.1:8545", env = "LEDGERFL_RPC_URL")]
    rpc_url: String,

    /// Federated-learning contract address
    #[arg(long, env = "LEDGERFL_CONTRACT")]
    contract: String,

    /// Bot account key (signs validateAndPay)
    #[arg(long, env = "LEDGERFL_BOT_PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Per-call ledger timeout in seconds
    #[arg(long, default_value = "15", env = "LEDGERFL_CALL_TIMEOUT")]
    call_timeout: u64,

    /// Gas price multiplier in percent of the network price
    #[arg(long, default_value = "130", env = "LEDGERFL_GAS_MULTIPLIER")]
    gas_multiplier: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::Config {
        coordinator_url: cli.coordinator,
        webhook_token: cli.webhook_token,
        artifacts_dir: cli.artifacts_dir,
        poll_interval: Duration::from_millis(cli.poll_ms),
        notify_attempts: cli.notify_attempts,
        notify_backoff: Duration::from_millis(cli.notify_backoff_ms),
        http_timeout: Duration::from_secs(cli.http_timeout),
        ledger: LedgerConfig {
            rpc_url: cli.rpc_url,
            contract_address: cli.contract,
            private_key: cli.private_key,
            call_timeout: Duration::from_secs(cli.call_timeout),
            gas_multiplier_pct: cli.gas_multiplier,
            reward_wei: cli.reward_wei,
            ..LedgerConfig::default()
        },
    };
    tracing::info!(
        coordinator = %cfg.coordinator_url,
        artifacts = %cfg.artifacts_dir.display(),
        interval = ?cfg.poll_interval,
        "Starting verification bot"
    );

    let ledger = EvmLedger::connect(cfg.ledger.clone()).await.context("connecting to the ledger")?;
    let notifier = WebhookClient::new(&cfg)?;
    let verifier = Verifier::new(Arc::new(ledger), Arc::new(notifier), cfg.artifacts_dir.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    verifier.run(cfg.poll_interval, shutdown_rx).await;
    tracing::info!("Verification bot shut down");
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
