use ledgerfl_protocol::LedgerConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub coordinator_url: String,
    /// Wallet address; also the participant id on the coordinator
    pub participant: String,
    pub dataset: PathBuf,
    pub label_column: String,
    pub drop_columns: Vec<String>,
    /// Only the first `max_rows` rows of the local CSV are used
    pub max_rows: Option<usize>,
    pub work_dir: PathBuf,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub epochs: usize,
    pub learning_rate: f64,
    pub seed: Option<u64>,
    pub ledger: LedgerConfig,
}
