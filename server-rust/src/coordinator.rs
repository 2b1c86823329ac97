//! Round state machine.
//!
//! ```text
//! Idle ──start_auto──► Active(r) ──quorum──► Aggregating(r) ──► Active(r+1) ──► … ──► Idle(Finished)
//!   ▲                                                  │ ledger write failed
//!   └──────────────────────────────────────────────────┘ (fail closed)
//! ```
//!
//! Every transition runs under one async mutex. The quorum check and the
//! aggregated-flag write happen in the same critical section, so concurrent
//! webhook calls aggregate a round at most once.

use ledgerfl_protocol::artifact::{self, ArtifactError};
use ledgerfl_protocol::{
    fed_avg, ArtifactKey, Evaluator, LedgerError, LedgerOracle, MetricRecord, Metrics, ModelParams, RoundStatus,
    VerifyOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::RoundState;
use crate::storage::{self, ArtifactStore};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("training is not active")]
    Inactive,
    #[error("a training session is already active")]
    AlreadyActive,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid participant: {0}")]
    InvalidParticipant(#[from] ArtifactError),
    #[error("ledger sync failed: {0}")]
    LedgerSync(#[source] LedgerError),
    #[error("storage failure: {0}")]
    Io(#[source] anyhow::Error),
}

pub struct Coordinator {
    state: Mutex<RoundState>,
    ledger: Arc<dyn LedgerOracle>,
    store: ArtifactStore,
    evaluator: Arc<dyn Evaluator>,
    data_dir: PathBuf,
}

impl Coordinator {
    pub fn new(
        ledger: Arc<dyn LedgerOracle>,
        store: ArtifactStore,
        evaluator: Arc<dyn Evaluator>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            state: Mutex::new(RoundState::default()),
            ledger,
            store,
            evaluator,
            data_dir,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Replaces the in-memory state with a persisted one (always inactive).
    pub async fn restore(&self, mut persisted: RoundState) {
        persisted.deactivate();
        tracing::info!(
            round = persisted.current_round,
            records = persisted.metrics.len(),
            "Restored round history"
        );
        *self.state.lock().await = persisted;
    }

    /// Idle -> Active(start). The start round comes from the ledger and is
    /// only exposed once the ledger confirmed it.
    pub async fn start_auto(&self, rounds: u64, participants: usize) -> Result<u64, CoordinatorError> {
        if rounds == 0 || participants == 0 {
            return Err(CoordinatorError::InvalidRequest(
                "rounds and participants must both be at least 1".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if state.training_active {
            return Err(CoordinatorError::AlreadyActive);
        }

        tracing::info!("Requesting a new round from the ledger");
        let start = self.ledger.start_new_round().await.map_err(|e| {
            tracing::warn!(error = %e, "Ledger sync failed, staying idle");
            CoordinatorError::LedgerSync(e)
        })?;

        state.activate(start, rounds, participants);
        self.persist(&state).await;
        tracing::info!(start_round = start, target_round = state.target_round, participants, "Automatic session started");
        Ok(start)
    }

    /// Operator override: forces Idle from any state.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.deactivate();
        self.persist(&state).await;
        tracing::info!(round = state.current_round, "Session stopped");
    }

    pub async fn status(&self) -> RoundStatus {
        self.state.lock().await.snapshot()
    }

    pub async fn metrics(&self) -> Vec<MetricRecord> {
        self.state.lock().await.metrics.clone()
    }

    /// Stores and scores an artifact for the current round. Never waits for
    /// verification; returns the round the upload was filed under.
    pub async fn upload(&self, participant: &str, reported_accuracy: f64, bytes: &[u8]) -> Result<u64, CoordinatorError> {
        let mut state = self.state.lock().await;
        if !state.training_active {
            return Err(CoordinatorError::Inactive);
        }
        artifact::validate_participant(participant)?;

        let round = state.current_round;
        let key = ArtifactKey::new(round, participant)?;
        self.store.write_artifact(&key, bytes).await.map_err(CoordinatorError::Io)?;

        let scored = self.score_upload(participant, bytes);
        let first = state.record_upload(participant, reported_accuracy, scored);
        self.persist(&state).await;
        tracing::info!(
            round,
            participant = %participant,
            server_accuracy = scored.accuracy,
            resubmission = !first,
            "Upload received, pending ledger verification"
        );
        Ok(round)
    }

    /// Webhook entry point for the verification bot.
    pub async fn verify_contribution(&self, participant: &str, round: u64) -> VerifyOutcome {
        let mut state = self.state.lock().await;
        if !state.training_active {
            return VerifyOutcome::Inactive;
        }
        if !state.mark_verified(round, participant) {
            tracing::debug!(round, participant = %participant, "Nothing to verify");
            return VerifyOutcome::Ignored;
        }
        tracing::info!(round, participant = %participant, "Contribution verified");

        let current = state.current_round;
        if state.is_aggregated(current) {
            self.persist(&state).await;
            return VerifyOutcome::AlreadyAggregated;
        }
        if state.has_quorum() {
            // Claimed before any fallible step; a failed attempt leaves the
            // round aggregated-but-unpublished rather than re-running it.
            state.aggregated_rounds.insert(current);
            self.aggregate_round(&mut state, current).await;
        }
        self.persist(&state).await;
        VerifyOutcome::Verified
    }

    async fn aggregate_round(&self, state: &mut RoundState, round: u64) {
        let verified = state.verified_participants(round);
        tracing::info!(round, verified = verified.len(), "Quorum reached, aggregating");

        let mut models = Vec::with_capacity(verified.len());
        for participant in &verified {
            let Ok(key) = ArtifactKey::new(round, participant.as_str()) else {
                continue;
            };
            match self.store.load_model(&key).await {
                Ok(Some(params)) => models.push(params),
                Ok(None) => tracing::warn!(round, participant = %participant, "Verified artifact is missing"),
                Err(e) => {
                    tracing::error!(round, error = %e, "Unreadable artifact, round left unaggregated");
                    return;
                }
            }
        }
        if models.is_empty() {
            tracing::error!(round, "No artifacts found for verified participants, round left unaggregated");
            return;
        }

        let global = match fed_avg(&models) {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(round, error = %e, "Aggregation failed, round left unaggregated");
                return;
            }
        };
        if let Err(e) = self.store.publish_global(&global, round).await {
            tracing::error!(round, error = %e, "Publishing the global model failed");
            return;
        }

        let scored = self.score_global(&global);
        tracing::info!(
            round,
            accuracy = scored.accuracy,
            f1 = scored.f1,
            loss = scored.loss,
            "Global model evaluated"
        );
        state.metrics.push(MetricRecord::global(round, scored));

        if round >= state.target_round {
            state.finish();
            tracing::info!(round, "Training finished");
            return;
        }
        match self.ledger.start_new_round().await {
            Ok(next) => {
                state.advance_to(next);
                tracing::info!(round = next, "Advanced to next round");
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not open the next round on the ledger, stopping");
                state.deactivate();
            }
        }
    }

    fn score_upload(&self, participant: &str, bytes: &[u8]) -> Metrics {
        let scored = ModelParams::from_json(bytes)
            .map_err(|e| e.to_string())
            .and_then(|p| self.evaluator.evaluate(&p).map_err(|e| e.to_string()));
        match scored {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(participant = %participant, error = %e, "Upload could not be scored");
                Metrics::unscored()
            }
        }
    }

    fn score_global(&self, global: &ModelParams) -> Metrics {
        self.evaluator.evaluate(global).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Global model could not be scored");
            Metrics::unscored()
        })
    }

    async fn persist(&self, state: &RoundState) {
        if let Err(e) = storage::save_state(&self.data_dir, state).await {
            tracing::warn!("Failed to persist round state: {e}");
        }
    }
}
