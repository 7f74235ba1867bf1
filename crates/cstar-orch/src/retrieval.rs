//! Pluggable data-fetch strategies.
//!
//! Blueprint inputs (initial conditions, forcing data, code) are
//! materialized into a per-run working directory through a `Retriever`.
//! Three strategies cover the sources the orchestrator meets: a local
//! copy, a remote HTTP download, and a git clone. Every retrieved file
//! is fingerprinted so later runs can detect drift from the source.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("io error retrieving `{location}`: {source}")]
    Io {
        location: String,
        source: std::io::Error,
    },
    #[error("download failed for `{location}`: {reason}")]
    Download { location: String, reason: String },
    #[error("clone failed for `{location}`: {reason}")]
    Clone { location: String, reason: String },
    #[error("checksum mismatch for `{location}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        location: String,
        expected: String,
        actual: String,
    },
}

/// Where data comes from, with an optional expected fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub location: String,
    pub checksum: Option<String>,
}

impl Source {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            checksum: None,
        }
    }

    pub fn with_checksum(location: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            checksum: Some(checksum.into()),
        }
    }
}

/// Data materialized into the run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub source: Source,
    pub path: PathBuf,
    /// Fingerprint taken at retrieval time (empty for directory trees).
    pub sha256: String,
}

impl Retrieved {
    /// Whether the local data has drifted since retrieval.
    pub fn changed_from_source(&self) -> bool {
        if !self.path.exists() {
            return true;
        }
        if self.sha256.is_empty() {
            return false;
        }
        match sha256_file(&self.path) {
            Ok(actual) => actual != self.sha256,
            Err(_) => true,
        }
    }
}

/// Contract for a data-fetch strategy.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Materialize `source` at `target`, which must not yet exist or may
    /// be overwritten.
    async fn retrieve(&self, target: &Path, source: &Source) -> Result<Retrieved, RetrievalError>;
}

/// Hex-encoded SHA-256 of a file's content.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

fn io_err(location: &str, source: std::io::Error) -> RetrievalError {
    RetrievalError::Io {
        location: location.to_string(),
        source,
    }
}

fn verify_checksum(source: &Source, actual: &str) -> Result<(), RetrievalError> {
    if let Some(expected) = &source.checksum {
        if expected != actual {
            return Err(RetrievalError::ChecksumMismatch {
                location: source.location.clone(),
                expected: expected.clone(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}

/// Copies a file from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileRetriever;

#[async_trait]
impl Retriever for LocalFileRetriever {
    async fn retrieve(&self, target: &Path, source: &Source) -> Result<Retrieved, RetrievalError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(&source.location, e))?;
        }
        tokio::fs::copy(&source.location, target)
            .await
            .map_err(|e| io_err(&source.location, e))?;

        let sha256 = sha256_file(target).map_err(|e| io_err(&source.location, e))?;
        verify_checksum(source, &sha256)?;

        debug!(location = %source.location, target = %target.display(), "copied local file");
        Ok(Retrieved {
            source: source.clone(),
            path: target.to_path_buf(),
            sha256,
        })
    }
}

/// Downloads a file over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct RemoteFileRetriever {
    client: reqwest::Client,
}

#[async_trait]
impl Retriever for RemoteFileRetriever {
    async fn retrieve(&self, target: &Path, source: &Source) -> Result<Retrieved, RetrievalError> {
        let response = self
            .client
            .get(&source.location)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| RetrievalError::Download {
                location: source.location.clone(),
                reason: e.to_string(),
            })?;

        let bytes = response.bytes().await.map_err(|e| RetrievalError::Download {
            location: source.location.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(&source.location, e))?;
        }
        tokio::fs::write(target, &bytes)
            .await
            .map_err(|e| io_err(&source.location, e))?;

        let sha256 = sha256_file(target).map_err(|e| io_err(&source.location, e))?;
        verify_checksum(source, &sha256)?;

        debug!(location = %source.location, bytes = bytes.len(), "downloaded remote file");
        Ok(Retrieved {
            source: source.clone(),
            path: target.to_path_buf(),
            sha256,
        })
    }
}

/// Clones a git repository at a target directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepoRetriever;

#[async_trait]
impl Retriever for RepoRetriever {
    async fn retrieve(&self, target: &Path, source: &Source) -> Result<Retrieved, RetrievalError> {
        let mut clone = tokio::process::Command::new("git");
        clone.args(["clone", "--depth", "1"]);
        // The checksum slot carries the ref for repository sources.
        if let Some(reference) = &source.checksum {
            clone.args(["--branch", reference]);
        }
        clone.arg(&source.location).arg(target);

        let output = clone.output().await.map_err(|e| RetrievalError::Clone {
            location: source.location.clone(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(RetrievalError::Clone {
                location: source.location.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(location = %source.location, target = %target.display(), "cloned repository");
        Ok(Retrieved {
            source: source.clone(),
            path: target.to_path_buf(),
            sha256: String::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Local,
    Remote,
    Repo,
}

fn strategy_for(location: &str) -> Strategy {
    if location.ends_with(".git") {
        Strategy::Repo
    } else if location.starts_with("http://") || location.starts_with("https://") {
        Strategy::Remote
    } else {
        Strategy::Local
    }
}

/// Pick a retrieval strategy for a source location.
pub fn select_retriever(source: &Source) -> Arc<dyn Retriever> {
    match strategy_for(&source.location) {
        Strategy::Repo => Arc::new(RepoRetriever),
        Strategy::Remote => Arc::new(RemoteFileRetriever::default()),
        Strategy::Local => Arc::new(LocalFileRetriever),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_copy_fingerprints_content() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("data.nc");
        std::fs::write(&original, b"ocean state").unwrap();

        let target = dir.path().join("run/inputs/data.nc");
        let source = Source::new(original.to_string_lossy());
        let retrieved = LocalFileRetriever.retrieve(&target, &source).await.unwrap();

        assert!(target.exists());
        assert_eq!(retrieved.sha256, sha256_file(&original).unwrap());
        assert!(!retrieved.changed_from_source());
    }

    #[tokio::test]
    async fn local_copy_verifies_expected_checksum() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("data.nc");
        std::fs::write(&original, b"ocean state").unwrap();

        let good = sha256_file(&original).unwrap();
        let target = dir.path().join("copy.nc");

        let source = Source::with_checksum(original.to_string_lossy(), good);
        LocalFileRetriever.retrieve(&target, &source).await.unwrap();

        let source = Source::with_checksum(original.to_string_lossy(), "deadbeef");
        let err = LocalFileRetriever
            .retrieve(&target, &source)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn drift_is_detected_after_modification() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("data.nc");
        std::fs::write(&original, b"v1").unwrap();

        let target = dir.path().join("copy.nc");
        let source = Source::new(original.to_string_lossy());
        let retrieved = LocalFileRetriever.retrieve(&target, &source).await.unwrap();

        std::fs::write(&target, b"v2").unwrap();
        assert!(retrieved.changed_from_source());
    }

    #[tokio::test]
    async fn missing_local_source_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let source = Source::new(dir.path().join("absent.nc").to_string_lossy());
        let err = LocalFileRetriever
            .retrieve(&dir.path().join("copy.nc"), &source)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Io { .. }));
    }

    #[test]
    fn retriever_selection_dispatches_on_location() {
        assert_eq!(
            strategy_for("https://github.com/org/model.git"),
            Strategy::Repo
        );
        assert_eq!(strategy_for("https://mockdoc.com/grid.nc"), Strategy::Remote);
        assert_eq!(strategy_for("http://mockdoc.com/grid.nc"), Strategy::Remote);
        assert_eq!(strategy_for("/data/grid.nc"), Strategy::Local);
        assert_eq!(strategy_for("relative/grid.nc"), Strategy::Local);
    }
}
