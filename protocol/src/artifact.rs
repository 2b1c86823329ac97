use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fixed extension of every stored model artifact
pub const ARTIFACT_EXTENSION: &str = "json";

/// Latest published global model, overwritten on every aggregation
pub const GLOBAL_MODEL_FILE: &str = "global_model.json";

const MAX_PARTICIPANT_LEN: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum ArtifactError {
    #[error("participant id is empty")]
    EmptyParticipant,
    #[error("participant id '{0}' must be at most 64 ASCII alphanumeric characters")]
    InvalidParticipant(String),
}

/// Immutable per-round snapshot of the global model
pub fn global_snapshot_file(round: u64) -> String {
    format!("global_model_round_{round}.{ARTIFACT_EXTENSION}")
}

/// Participant ids double as file name components, so only ASCII
/// alphanumerics are allowed (wallet addresses like `0xAbC…` qualify).
pub fn validate_participant(id: &str) -> Result<(), ArtifactError> {
    if id.is_empty() {
        return Err(ArtifactError::EmptyParticipant);
    }
    if id.len() > MAX_PARTICIPANT_LEN || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ArtifactError::InvalidParticipant(id.to_string()));
    }
    Ok(())
}

/// The (round, participant) key encoded in `round_<round>_<participant>.json`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub round: u64,
    pub participant: String,
}

impl ArtifactKey {
    pub fn new(round: u64, participant: impl Into<String>) -> Result<Self, ArtifactError> {
        let participant = participant.into();
        validate_participant(&participant)?;
        Ok(Self { round, participant })
    }

    pub fn file_name(&self) -> String {
        format!("round_{}_{}.{}", self.round, self.participant, ARTIFACT_EXTENSION)
    }

    /// Inverse of [`file_name`](Self::file_name); `None` for anything else.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix("round_")?
            .strip_suffix(ARTIFACT_EXTENSION)?
            .strip_suffix('.')?;
        let (round, participant) = stem.split_once('_')?;
        if round.is_empty() || !round.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Self::new(round.parse().ok()?, participant).ok()
    }
}

/// Lists every well-named artifact in `dir`, skipping anything else.
pub async fn list_artifacts(dir: &Path) -> std::io::Result<Vec<(ArtifactKey, PathBuf)>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(key) = name.to_str().and_then(ArtifactKey::parse) {
            found.push((key, entry.path()));
        }
    }
    found.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    Ok(found)
}

/// `0x`-prefixed lowercase SHA-256 of the full artifact bytes
pub fn digest_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(Sha256::digest(bytes)))
}

/// Ledger hashes come back in whatever case the client library prints.
pub fn hashes_match(local: &str, recorded: &str) -> bool {
    local.trim().eq_ignore_ascii_case(recorded.trim())
}
