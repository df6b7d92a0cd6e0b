//! Transient job config artifacts.
//!
//! Each job attempt's parameters are written to their own JSON file, whose
//! path is handed to the child program. The file lives exactly as long as the
//! attempt: [`StagedConfig::release`] removes it once the child has
//! terminated, and dropping an unreleased [`StagedConfig`] removes it as well.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Process-wide sequence making tokens unique even within one clock tick.
static STAGE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Errors while writing a staged config.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Failed to write staged config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize job parameters: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writes job parameters into a staging directory.
#[derive(Debug, Clone)]
pub struct ConfigStager {
    dir: PathBuf,
}

impl ConfigStager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize `parameters` to a new, uniquely named file.
    ///
    /// The file is opened with `create_new`, so an existing artifact is
    /// never overwritten.
    pub async fn stage(
        &self,
        parameters: &serde_json::Value,
    ) -> Result<StagedConfig, StagingError> {
        let body = serde_json::to_vec_pretty(parameters)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StagingError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let token = next_token();
        let path = self.dir.join(format!("config_{token}.json"));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| StagingError::Io {
                path: path.clone(),
                source,
            })?;

        // From here on the guard owns the file and removes it on failure.
        let staged = StagedConfig {
            token,
            path,
            released: false,
        };

        let written = async {
            file.write_all(&body).await?;
            file.flush().await
        }
        .await;
        if let Err(source) = written {
            return Err(StagingError::Io {
                path: staged.path.clone(),
                source,
            });
        }

        debug!(path = %staged.path.display(), "Staged job config");
        Ok(staged)
    }
}

/// Unique token: wall-clock nanoseconds, process id and a sequence number.
fn next_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = STAGE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{nanos}_{}_{seq}", std::process::id())
}

/// A staged config file owned by one job attempt.
#[derive(Debug)]
pub struct StagedConfig {
    token: String,
    path: PathBuf,
    released: bool,
}

impl StagedConfig {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Remove the artifact. Idempotent: releasing twice, or releasing a file
    /// someone already deleted, is a no-op. Other failures are logged and
    /// left for the drop guard to retry.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Released staged config");
                self.released = true;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.released = true;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staged config");
            }
        }
    }
}

impl Drop for StagedConfig {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed unreleased staged config"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staged config on drop");
            }
        }
    }
}
