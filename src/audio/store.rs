//! Scratch storage for received recordings.
//!
//! Everything lives in one private temporary directory that is removed
//! when the store is dropped at shutdown.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

const CHIME_FILE: &str = "ding.wav";

#[derive(Debug)]
pub struct AudioStore {
    dir: TempDir,
}

impl AudioStore {
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("stentor_").tempdir()?;
        debug!(path = %dir.path().display(), "Created audio directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn chime_path(&self) -> PathBuf {
        self.path().join(CHIME_FILE)
    }

    /// Persist one recording under a fresh unique name.
    pub async fn save_message(&self, data: &[u8]) -> io::Result<PathBuf> {
        let path = self
            .path()
            .join(format!("{}.webm", Uuid::new_v4().simple()));
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }
}

/// Delete a file that may already be gone.
pub async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed audio file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove audio file"),
    }
}
