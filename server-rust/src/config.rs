use ledgerfl_protocol::LedgerConfig;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Held-out CSV used to score uploads and global models
    pub reference_data: Option<PathBuf>,
    pub label_column: String,
    pub drop_columns: Vec<String>,
    pub control_token: Option<String>,
    pub webhook_token: Option<String>,
    pub max_upload_bytes: usize,
    pub ledger: LedgerConfig,
}

impl Config {
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn static_dir(&self) -> PathBuf {
        self.data_dir.join("static")
    }
}
