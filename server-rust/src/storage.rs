use anyhow::{Context, Result};
use ledgerfl_protocol::artifact::{global_snapshot_file, GLOBAL_MODEL_FILE};
use ledgerfl_protocol::{ArtifactKey, ModelParams};
use std::path::{Path, PathBuf};

use crate::models::RoundState;

const STATE_FILE: &str = "round_state.json";

/// Uploaded participant artifacts plus the published global models.
///
/// The artifacts directory is shared with the verification bot, which reads
/// it by file name; writes go through a temporary name so the bot never
/// hashes a half-written file.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    artifacts_dir: PathBuf,
    static_dir: PathBuf,
}

impl ArtifactStore {
    pub async fn open(artifacts_dir: PathBuf, static_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&artifacts_dir)
            .await
            .with_context(|| format!("creating {}", artifacts_dir.display()))?;
        tokio::fs::create_dir_all(&static_dir)
            .await
            .with_context(|| format!("creating {}", static_dir.display()))?;
        Ok(Self { artifacts_dir, static_dir })
    }

    pub fn static_dir(&self) -> &Path {
        &self.static_dir
    }

    pub fn artifact_path(&self, key: &ArtifactKey) -> PathBuf {
        self.artifacts_dir.join(key.file_name())
    }

    /// Overwrites any previous artifact for the same (round, participant).
    pub async fn write_artifact(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.artifact_path(key);
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    /// `None` when the artifact no longer exists.
    pub async fn load_model(&self, key: &ArtifactKey) -> Result<Option<ModelParams>> {
        let path = self.artifact_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let params = ModelParams::from_json(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(params))
    }

    /// Writes the latest global model and its per-round snapshot.
    pub async fn publish_global(&self, params: &ModelParams, round: u64) -> Result<()> {
        let bytes = params.to_json()?;
        write_atomic(&self.static_dir.join(global_snapshot_file(round)), &bytes).await?;
        write_atomic(&self.static_dir.join(GLOBAL_MODEL_FILE), &bytes).await?;
        tracing::info!(round, "Published global model");
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("moving {} into place", path.display()))?;
    Ok(())
}

pub async fn save_state(data_dir: &Path, state: &RoundState) -> Result<()> {
    tokio::fs::create_dir_all(data_dir).await?;
    let json = serde_json::to_string_pretty(state)?;
    write_atomic(&data_dir.join(STATE_FILE), json.as_bytes()).await
}

/// Restores history from a previous run. The session itself is never
/// resumed: the returned state is always inactive.
pub async fn load_state(data_dir: &Path) -> Result<Option<RoundState>> {
    let data = match tokio::fs::read_to_string(data_dir.join(STATE_FILE)).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut state: RoundState = serde_json::from_str(&data).context("parsing persisted round state")?;
    state.deactivate();
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerfl_protocol::Metrics;

    fn params() -> ModelParams {
        ModelParams {
            coefficients: vec![vec![1.0, 2.0]],
            intercepts: vec![0.5],
            classes: vec![0, 1],
            feature_names: vec!["a".into(), "b".into()],
        }
    }

    async fn store(dir: &Path) -> ArtifactStore {
        ArtifactStore::open(dir.join("artifacts"), dir.join("static")).await.unwrap()
    }

    #[tokio::test]
    async fn test_artifact_overwrite_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let key = ArtifactKey::new(3, "0xaaa").unwrap();

        store.write_artifact(&key, b"first").await.unwrap();
        let path = store.write_artifact(&key, &params().to_json().unwrap()).await.unwrap();
        assert!(path.ends_with("round_3_0xaaa.json"));
        assert_eq!(store.load_model(&key).await.unwrap(), Some(params()));

        let missing = ArtifactKey::new(3, "0xbbb").unwrap();
        assert_eq!(store.load_model(&missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unparseable_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let key = ArtifactKey::new(1, "0xaaa").unwrap();
        store.write_artifact(&key, b"not json").await.unwrap();
        assert!(store.load_model(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_writes_latest_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.publish_global(&params(), 5).await.unwrap();

        let latest = tokio::fs::read(store.static_dir().join("global_model.json")).await.unwrap();
        let snapshot = tokio::fs::read(store.static_dir().join("global_model_round_5.json")).await.unwrap();
        assert_eq!(latest, snapshot);
        assert_eq!(ModelParams::from_json(&latest).unwrap(), params());
    }

    #[tokio::test]
    async fn test_state_round_trip_comes_back_inactive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(dir.path()).await.unwrap().is_none());

        let mut state = RoundState::default();
        state.activate(2, 3, 2);
        state.record_upload("0xaaa", 0.8, Metrics::unscored());
        state.aggregated_rounds.insert(1);
        save_state(dir.path(), &state).await.unwrap();

        let restored = load_state(dir.path()).await.unwrap().unwrap();
        assert!(!restored.training_active);
        assert_eq!(restored.current_round, 2);
        assert_eq!(restored.metrics.len(), 1);
        assert!(restored.aggregated_rounds.contains(&1));
    }
}
