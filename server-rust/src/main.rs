mod config;
mod coordinator;
mod models;
mod routes;
mod state;
mod storage;

use anyhow::{Context, Result};
use clap::Parser;
use ledgerfl_protocol::ledger::EvmLedger;
use ledgerfl_protocol::{Dataset, Evaluator, LedgerConfig, ReferenceEvaluator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::storage::ArtifactStore;

#[derive(Parser)]
#[command(name = "ledgerfl-coordinator", about = "Round coordinator for ledger-anchored federated learning")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "8000", env = "LEDGERFL_PORT")]
    port: u16,

    /// Data directory for artifacts, global models and persisted state
    #[arg(long, default_value = "./coordinator-data", env = "LEDGERFL_DATA_DIR")]
    data_dir: PathBuf,

    /// Held-out CSV used to score uploads (scoring falls back when absent)
    #[arg(long, env = "LEDGERFL_REFERENCE_DATA")]
    reference_data: Option<PathBuf>,

    /// Label column of the reference CSV
    #[arg(long, default_value = "label", env = "LEDGERFL_LABEL_COLUMN")]
    label_column: String,

    /// Comma-separated columns dropped from the reference CSV
    #[arg(long, value_delimiter = ',', env = "LEDGERFL_DROP_COLUMNS")]
    drop_columns: Vec<String>,

    /// Bearer token for /control routes
    #[arg(long, env = "LEDGERFL_CONTROL_TOKEN")]
    control_token: Option<String>,

    /// Bearer token the verification bot presents on the webhook
    #[arg(long, env = "LEDGERFL_WEBHOOK_TOKEN")]
    webhook_token: Option<String>,

    /// Maximum upload size in bytes
    #[arg(long, default_value = "16777216", env = "LEDGERFL_MAX_UPLOAD")]
    max_upload_bytes: usize,

    /// Ledger JSON-RPC endpoint
    #[arg(long, default_value = "http://127.0.0.1:8545", env = "LEDGERFL_RPC_URL")]
    rpc_url: String,

    /// Federated-learning contract address
    #[arg(long, env = "LEDGERFL_CONTRACT")]
    contract: String,

    /// Coordinator account key (signs startNewRound)
    #[arg(long, env = "LEDGERFL_PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Per-call ledger timeout in seconds
    #[arg(long, default_value = "15", env = "LEDGERFL_CALL_TIMEOUT")]
    call_timeout: u64,

    /// Seconds to wait for a round-start receipt
    #[arg(long, default_value = "180", env = "LEDGERFL_CONFIRMATION_TIMEOUT")]
    confirmation_timeout: u64,

    /// Gas price multiplier in percent of the network price
    #[arg(long, default_value = "110", env = "LEDGERFL_GAS_MULTIPLIER")]
    gas_multiplier: u64,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            port: self.port,
            data_dir: self.data_dir,
            reference_data: self.reference_data,
            label_column: self.label_column,
            drop_columns: self.drop_columns,
            control_token: self.control_token,
            webhook_token: self.webhook_token,
            max_upload_bytes: self.max_upload_bytes,
            ledger: LedgerConfig {
                rpc_url: self.rpc_url,
                contract_address: self.contract,
                private_key: self.private_key,
                call_timeout: Duration::from_secs(self.call_timeout),
                confirmation_timeout: Duration::from_secs(self.confirmation_timeout),
                gas_multiplier_pct: self.gas_multiplier,
                ..LedgerConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Cli::parse().into_config();
    tracing::info!(port = cfg.port, data_dir = %cfg.data_dir.display(), "Starting coordinator");

    let ledger = EvmLedger::connect(cfg.ledger.clone()).await.context("connecting to the ledger")?;
    let store = ArtifactStore::open(cfg.artifacts_dir(), cfg.static_dir()).await?;
    let evaluator = load_evaluator(&cfg).await;

    let coordinator = Coordinator::new(Arc::new(ledger), store, evaluator, cfg.data_dir.clone());
    match storage::load_state(&cfg.data_dir).await {
        Ok(Some(persisted)) => coordinator.restore(persisted).await,
        Ok(None) => {}
        Err(e) => tracing::warn!("Failed to load persisted state: {e}"),
    }

    let state = state::AppState::new(coordinator, cfg.control_token.clone(), cfg.webhook_token.clone());
    let app = routes::create_router(state, cfg.max_upload_bytes).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Coordinator shut down");
    Ok(())
}

/// Scoring is optional: without a reference set every upload gets the
/// fallback metrics.
async fn load_evaluator(cfg: &Config) -> Arc<dyn Evaluator> {
    let Some(path) = &cfg.reference_data else {
        tracing::warn!("No reference dataset configured, uploads will not be scored");
        return Arc::new(ReferenceEvaluator::empty());
    };
    match Dataset::from_csv(path, &cfg.label_column, &cfg.drop_columns).await {
        Ok(mut dataset) => {
            dataset.standardize();
            tracing::info!(rows = dataset.len(), features = dataset.n_features(), "Loaded reference dataset");
            Arc::new(ReferenceEvaluator::new(dataset))
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to load reference dataset: {e}");
            Arc::new(ReferenceEvaluator::empty())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
