use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use notemirror_core::PageSnapshot;
use thiserror::Error;
use tracing::warn;

use super::paths::{self, PathError};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

/// Writes node snapshots under the output root. A write failure is fatal to
/// that node's update; callers must not touch the cache or download resources
/// for a node whose snapshot did not land on disk.
#[derive(Clone)]
pub struct SnapshotWriter {
    output_root: PathBuf,
}

impl SnapshotWriter {
    pub fn new(output_root: &Path) -> Self {
        Self {
            output_root: output_root.to_path_buf(),
        }
    }

    pub async fn save(
        &self,
        id: &str,
        snapshot: &PageSnapshot,
        ancestors: &[String],
    ) -> Result<PathBuf, WriteError> {
        let dir = paths::node_dir(&self.output_root, ancestors, id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let path = paths::snapshot_path(&self.output_root, ancestors, id)?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Read a previously persisted snapshot back. Missing or unparseable
    /// files resolve to `None`; the change detector treats both as a stale
    /// local copy.
    pub async fn load(
        &self,
        id: &str,
        ancestors: &[String],
    ) -> Result<Option<PageSnapshot>, WriteError> {
        let path = paths::snapshot_path(&self.output_root, ancestors, id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "persisted snapshot is unparseable");
                Ok(None)
            }
        }
    }
}
