//! One tick: read the ledger round, scan the shared artifact directory,
//! and settle every current-round artifact that is not yet handled.
//!
//! Payments are submitted without waiting for confirmation so the scan
//! keeps moving; the coordinator's round-start write is the only ledger
//! call anyone waits on.

use ledgerfl_protocol::artifact::{digest_hex, hashes_match, list_artifacts};
use ledgerfl_protocol::ledger::TxId;
use ledgerfl_protocol::{LedgerError, LedgerOracle};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::client::CoordinatorNotifier;

#[derive(Debug, Error)]
pub enum TickError {
    #[error("reading the ledger round failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("scanning the artifact directory failed: {0}")]
    Scan(#[from] std::io::Error),
}

/// What happened to one participant's artifact during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No hash on the ledger yet
    NotCommitted,
    Paid { tx: TxId, notified: bool },
    /// Paid earlier (by a previous run or tick); coordinator re-synced
    AlreadyPaid { notified: bool },
    /// Local digest differs from the ledger commitment
    Fraud { local: String, recorded: String },
    /// A notification left over from an earlier tick went through
    Renotified,
    /// Transient failure, retried next tick
    Deferred(String),
}

impl Outcome {
    /// Settled outcomes put the participant in the processed cache.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid { .. } | Self::AlreadyPaid { .. } | Self::Fraud { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub round: u64,
    pub outcomes: Vec<(String, Outcome)>,
    pub pending_notifications: usize,
}

pub struct Verifier {
    ledger: Arc<dyn LedgerOracle>,
    notifier: Arc<dyn CoordinatorNotifier>,
    artifacts_dir: PathBuf,
    last_round: Option<u64>,
    processed: HashSet<String>,
    /// Paid but the coordinator has not acknowledged yet
    pending_notify: BTreeSet<String>,
}

impl Verifier {
    pub fn new(ledger: Arc<dyn LedgerOracle>, notifier: Arc<dyn CoordinatorNotifier>, artifacts_dir: PathBuf) -> Self {
        Self {
            ledger,
            notifier,
            artifacts_dir,
            last_round: None,
            processed: HashSet::new(),
            pending_notify: BTreeSet::new(),
        }
    }

    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        let round = self.ledger.current_round().await?;
        if self.last_round != Some(round) {
            if let Some(previous) = self.last_round {
                tracing::info!(from = previous, to = round, "Ledger round changed, clearing processed cache");
            }
            self.processed.clear();
            self.pending_notify.clear();
            self.last_round = Some(round);
        }

        let mut outcomes = Vec::new();
        for participant in std::mem::take(&mut self.pending_notify) {
            if self.notify(&participant, round).await {
                outcomes.push((participant, Outcome::Renotified));
            }
        }

        for (key, path) in list_artifacts(&self.artifacts_dir).await? {
            if key.round != round {
                continue;
            }
            if self.processed.contains(&key.participant) {
                continue;
            }
            let outcome = self.settle(round, &key.participant, &path).await;
            if outcome.is_settled() {
                self.processed.insert(key.participant.clone());
            }
            outcomes.push((key.participant, outcome));
        }

        Ok(TickReport {
            round,
            outcomes,
            pending_notifications: self.pending_notify.len(),
        })
    }

    async fn settle(&mut self, round: u64, participant: &str, path: &Path) -> Outcome {
        let commitment = match self.ledger.get_contribution(round, participant).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(round, participant = %participant, "Contribution lookup failed: {e}");
                return Outcome::Deferred(e.to_string());
            }
        };
        if !commitment.is_committed() {
            tracing::debug!(round, participant = %participant, "Artifact present, no commitment yet");
            return Outcome::NotCommitted;
        }
        if commitment.paid {
            tracing::info!(round, participant = %participant, "Already paid, re-syncing coordinator");
            let notified = self.notify(participant, round).await;
            return Outcome::AlreadyPaid { notified };
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Could not read artifact: {e}");
                return Outcome::Deferred(e.to_string());
            }
        };
        let local = digest_hex(&bytes);
        if !hashes_match(&local, &commitment.hash) {
            tracing::error!(
                round,
                participant = %participant,
                local = %local,
                recorded = %commitment.hash,
                "Fraud detected: artifact digest does not match the ledger commitment"
            );
            return Outcome::Fraud { local, recorded: commitment.hash };
        }

        let tx = match self.ledger.validate_and_pay(participant).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(round, participant = %participant, "Payment failed: {e}");
                return Outcome::Deferred(e.to_string());
            }
        };
        tracing::info!(round, participant = %participant, tx = %tx, "Hash verified, reward sent");
        let notified = self.notify(participant, round).await;
        Outcome::Paid { tx, notified }
    }

    /// False when the coordinator could not be reached; the participant is
    /// then queued for the next tick.
    async fn notify(&mut self, participant: &str, round: u64) -> bool {
        match self.notifier.notify_verified(participant, round).await {
            Ok(outcome) => {
                tracing::info!(round, participant = %participant, ?outcome, "Coordinator notified");
                true
            }
            Err(e) => {
                tracing::warn!(round, participant = %participant, "Coordinator notification failed: {e:#}");
                self.pending_notify.insert(participant.to_string());
                false
            }
        }
    }

    /// Ticks every `period` until `shutdown` flips. Ticks never overlap.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("Verifier stopping");
                    return;
                }
            }
            match self.tick().await {
                Ok(report) if !report.outcomes.is_empty() => {
                    tracing::debug!(round = report.round, outcomes = ?report.outcomes, "Tick complete");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Tick failed: {e}"),
            }
        }
    }
}
