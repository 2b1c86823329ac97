use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ledgerfl_protocol::{VerifyOutcome, VerifyRequest, VerifyResponse};
use std::time::Duration;

use crate::config::Config;

/// Delivery of "this contribution is paid" to the coordinator
#[async_trait]
pub trait CoordinatorNotifier: Send + Sync {
    async fn notify_verified(&self, participant: &str, round: u64) -> Result<VerifyOutcome>;
}

/// Calls `POST /webhook/verify_contribution`, retrying with a fixed backoff.
pub struct WebhookClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    attempts: u32,
    backoff: Duration,
}

impl WebhookClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.coordinator_url.trim_end_matches('/').to_string(),
            token: cfg.webhook_token.clone(),
            attempts: cfg.notify_attempts.max(1),
            backoff: cfg.notify_backoff,
        })
    }

    async fn post_once(&self, body: &VerifyRequest) -> Result<VerifyOutcome> {
        let mut req = self
            .http
            .post(format!("{}/webhook/verify_contribution", self.base_url))
            .json(body);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let resp = req.send().await.context("webhook unreachable")?;
        if !resp.status().is_success() {
            bail!("webhook returned {}", resp.status());
        }
        let parsed: VerifyResponse = resp.json().await.context("parsing webhook response")?;
        Ok(parsed.status)
    }
}

#[async_trait]
impl CoordinatorNotifier for WebhookClient {
    async fn notify_verified(&self, participant: &str, round: u64) -> Result<VerifyOutcome> {
        let body = VerifyRequest {
            participant_address: participant.to_string(),
            round,
        };
        let mut attempt = 1;
        loop {
            match self.post_once(&body).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.attempts => {
                    tracing::warn!(attempt, participant = %participant, "Notify failed: {e:#}, retrying in {:?}", self.backoff);
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
