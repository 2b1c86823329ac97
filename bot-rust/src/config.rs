use ledgerfl_protocol::LedgerConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub coordinator_url: String,
    pub webhook_token: Option<String>,
    /// Artifact directory shared with the coordinator
    pub artifacts_dir: PathBuf,
    pub poll_interval: Duration,
    pub notify_attempts: u32,
    pub notify_backoff: Duration,
    pub http_timeout: Duration,
    pub ledger: LedgerConfig,
}
