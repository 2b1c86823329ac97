use anyhow::{Context, Result};
use ledgerfl_protocol::artifact::{digest_hex, hashes_match, ArtifactKey};
use ledgerfl_protocol::{Dataset, LedgerOracle};
use std::path::PathBuf;
use std::sync::Arc;

use crate::client::CoordinatorApi;
use crate::trainer::Trainer;

#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Hash committed and artifact uploaded
    Submitted { hash: String, accuracy: f64 },
    /// Committed earlier; the matching local artifact was uploaded again
    Reuploaded { hash: String },
    /// The ledger already holds a hash this agent has no artifact for
    AlreadyCommitted,
    LedgerInactive,
}

impl RoundOutcome {
    /// Whether this round needs no further attempts from this agent.
    pub fn is_settled(&self) -> bool {
        !matches!(self, RoundOutcome::LedgerInactive)
    }
}

pub struct Participant {
    pub id: String,
    pub ledger: Arc<dyn LedgerOracle>,
    pub coordinator: Arc<dyn CoordinatorApi>,
    pub trainer: Box<dyn Trainer>,
    pub dataset: Dataset,
    pub work_dir: PathBuf,
}

impl Participant {
    /// Train, commit the digest on the ledger, then upload the exact bytes
    /// that were hashed.
    pub async fn train_and_submit(&self, round: u64) -> Result<RoundOutcome> {
        tracing::info!(round, participant = %self.id, "Starting round");

        if !self.ledger.is_training_active().await? {
            tracing::warn!(round, "Training is not active on the ledger");
            return Ok(RoundOutcome::LedgerInactive);
        }
        let key = ArtifactKey::new(round, self.id.as_str())?;
        let path = self.work_dir.join(key.file_name());

        let existing = self.ledger.get_contribution(round, &self.id).await?;
        if existing.is_committed() {
            // A previous attempt may have committed but failed to upload.
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if hashes_match(&digest_hex(&bytes), &existing.hash) {
                    let ack = self.coordinator.upload(&self.id, 0.0, bytes).await?;
                    tracing::info!(round, message = %ack.message, "Re-uploaded committed artifact");
                    return Ok(RoundOutcome::Reuploaded { hash: existing.hash });
                }
            }
            tracing::info!(round, hash = %existing.hash, "Already contributed this round, skipping");
            return Ok(RoundOutcome::AlreadyCommitted);
        }

        let global = match self.coordinator.global_model().await {
            Ok(g) => g,
            Err(e) => {
                tracing::info!("No global model available ({e:#}), training from scratch");
                None
            }
        };
        let outcome = self.trainer.train(&self.dataset, global.as_ref())?;

        let bytes = outcome.params.to_json()?;
        tokio::fs::create_dir_all(&self.work_dir).await?;
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        let hash = digest_hex(&bytes);
        let tx = self.ledger.submit_update(&hash).await.context("committing hash")?;
        tracing::info!(round, hash = %hash, tx = %tx, "Hash committed, not waiting for confirmation");

        let ack = self.coordinator.upload(&self.id, outcome.accuracy, bytes).await?;
        tracing::info!(round, accuracy = outcome.accuracy, message = %ack.message, "Artifact uploaded");
        Ok(RoundOutcome::Submitted { hash, accuracy: outcome.accuracy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::LogisticTrainer;
    use async_trait::async_trait;
    use ledgerfl_protocol::ledger::MemoryLedger;
    use ledgerfl_protocol::{ModelParams, RoundStatus, UploadAck, PENDING_VERIFICATION};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCoordinator {
        global: Option<ModelParams>,
        uploads: Mutex<Vec<(String, f64, Vec<u8>)>>,
    }

    #[async_trait]
    impl CoordinatorApi for FakeCoordinator {
        async fn status(&self) -> Result<RoundStatus> {
            anyhow::bail!("not used")
        }

        async fn global_model(&self) -> Result<Option<ModelParams>> {
            Ok(self.global.clone())
        }

        async fn upload(&self, participant: &str, accuracy: f64, artifact: Vec<u8>) -> Result<UploadAck> {
            self.uploads.lock().unwrap().push((participant.to_string(), accuracy, artifact));
            Ok(UploadAck { message: PENDING_VERIFICATION.into() })
        }
    }

    fn dataset() -> Dataset {
        let features = (0..40).map(|i| vec![if i % 2 == 0 { -1.0 } else { 1.0 }, (i % 5) as f64]).collect();
        let labels = (0..40).map(|i| i % 2).collect();
        Dataset { feature_names: vec!["a".into(), "b".into()], features, labels }
    }

    fn participant(ledger: &MemoryLedger, coordinator: Arc<FakeCoordinator>, dir: &std::path::Path) -> Participant {
        Participant {
            id: "0xaaa".into(),
            ledger: Arc::new(ledger.as_account("0xaaa")),
            coordinator,
            trainer: Box::new(LogisticTrainer { epochs: 50, seed: Some(1), ..LogisticTrainer::default() }),
            dataset: dataset(),
            work_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_commits_digest_of_uploaded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MemoryLedger::new("coordinator");
        ledger.start_new_round().await.unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let p = participant(&ledger, coordinator.clone(), dir.path());

        let RoundOutcome::Submitted { hash, .. } = p.train_and_submit(1).await.unwrap() else {
            panic!("expected a submission");
        };

        let uploads = coordinator.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(digest_hex(&uploads[0].2), hash);
        assert_eq!(ledger.get_contribution(1, "0xaaa").await.unwrap().hash, hash);
        let on_disk = tokio::fs::read(dir.path().join("round_1_0xaaa.json")).await.unwrap();
        assert_eq!(on_disk, uploads[0].2);
    }

    #[tokio::test]
    async fn test_committed_round_reuploads_local_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MemoryLedger::new("coordinator");
        ledger.start_new_round().await.unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let p = participant(&ledger, coordinator.clone(), dir.path());

        let RoundOutcome::Submitted { hash, .. } = p.train_and_submit(1).await.unwrap() else {
            panic!("expected a submission");
        };
        assert_eq!(p.train_and_submit(1).await.unwrap(), RoundOutcome::Reuploaded { hash });

        let uploads = coordinator.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].2, uploads[1].2);
        // one commitment only
        assert_eq!(ledger.transactions().len(), 2);
    }

    #[tokio::test]
    async fn test_skips_foreign_commitment() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MemoryLedger::new("coordinator");
        ledger.start_new_round().await.unwrap();
        let hash = digest_hex(b"committed elsewhere");
        ledger.as_account("0xaaa").submit_update(&hash).await.unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let p = participant(&ledger, coordinator.clone(), dir.path());

        assert_eq!(p.train_and_submit(1).await.unwrap(), RoundOutcome::AlreadyCommitted);
        assert!(coordinator.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_ledger_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MemoryLedger::new("coordinator");
        let coordinator = Arc::new(FakeCoordinator::default());
        let p = participant(&ledger, coordinator.clone(), dir.path());

        assert_eq!(p.train_and_submit(1).await.unwrap(), RoundOutcome::LedgerInactive);
        assert!(coordinator.uploads.lock().unwrap().is_empty());
        assert!(ledger.transactions().is_empty());

        // The ledger flag catches up later: the same round is still contributed
        ledger.start_new_round().await.unwrap();
        let outcome = p.train_and_submit(1).await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Submitted { .. }));
        assert!(outcome.is_settled());
        assert!(!RoundOutcome::LedgerInactive.is_settled());
        assert!(RoundOutcome::AlreadyCommitted.is_settled());
    }

    #[tokio::test]
    async fn test_warm_starts_from_global_model() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MemoryLedger::new("coordinator");
        ledger.start_new_round().await.unwrap();
        let mut global = ModelParams::zeros(vec![0, 1], vec!["a".into(), "b".into()], 2);
        global.coefficients[0][0] = 5.0;
        let coordinator = Arc::new(FakeCoordinator { global: Some(global), ..Default::default() });
        let p = participant(&ledger, coordinator.clone(), dir.path());

        p.train_and_submit(1).await.unwrap();
        let uploads = coordinator.uploads.lock().unwrap().clone();
        let params = ModelParams::from_json(&uploads[0].2).unwrap();
        // Descent moves away from the start but keeps the sign of a correct weight
        assert!(params.coefficients[0][0] > 1.0);
    }
}
