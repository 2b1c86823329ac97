use anyhow::{Context, Result};
use async_trait::async_trait;
use ledgerfl_protocol::artifact::GLOBAL_MODEL_FILE;
use ledgerfl_protocol::{ModelParams, RoundStatus, UploadAck};
use reqwest::multipart::{Form, Part};

use crate::config::Config;

/// The coordinator surface a participant talks to
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn status(&self) -> Result<RoundStatus>;

    /// `None` before the first aggregation.
    async fn global_model(&self) -> Result<Option<ModelParams>>;

    async fn upload(&self, participant: &str, accuracy: f64, artifact: Vec<u8>) -> Result<UploadAck>;
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.coordinator_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CoordinatorApi for CoordinatorClient {
    async fn status(&self) -> Result<RoundStatus> {
        let url = format!("{}/status", self.base_url);
        let resp = self.http.get(&url).send().await
            .context("Failed to reach coordinator")?;
        if !resp.status().is_success() {
            anyhow::bail!("Status failed: HTTP {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn global_model(&self) -> Result<Option<ModelParams>> {
        let url = format!("{}/static/{}", self.base_url, GLOBAL_MODEL_FILE);
        let resp = self.http.get(&url).send().await
            .context("Failed to download global model")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("Global model download failed: HTTP {}", resp.status());
        }
        let bytes = resp.bytes().await?;
        Ok(Some(ModelParams::from_json(&bytes).context("parsing global model")?))
    }

    async fn upload(&self, participant: &str, accuracy: f64, artifact: Vec<u8>) -> Result<UploadAck> {
        let url = format!("{}/upload", self.base_url);
        let file = Part::bytes(artifact)
            .file_name(format!("{participant}.json"))
            .mime_str("application/json")?;
        let form = Form::new()
            .text("participant_address", participant.to_string())
            .text("accuracy", accuracy.to_string())
            .part("file", file);
        let resp = self.http.post(&url).multipart(form).send().await
            .context("Failed to upload artifact")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Upload rejected: HTTP {status}: {body}");
        }
        Ok(resp.json().await?)
    }
}
