//! Local cache of model artifacts fetched from a Hugging Face style repository.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("download incomplete for {file}: expected {expected} bytes, got {actual}")]
    Incomplete { file: String, expected: u64, actual: u64 },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves model files to local paths, downloading on first use.
#[derive(Debug, Clone)]
pub struct ModelCache {
    endpoint: String,
    repo: String,
    cache_dir: PathBuf,
}

impl ModelCache {
    pub fn new(endpoint: impl Into<String>, repo: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            repo: repo.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn local_path(&self, file: &str) -> PathBuf {
        self.cache_dir.join(file)
    }

    pub fn url_for(&self, file: &str) -> String {
        format!(
            "{}/{}/resolve/main/{}",
            self.endpoint.trim_end_matches('/'),
            self.repo,
            file
        )
    }

    /// Return the local path of `file`, downloading it if absent.
    ///
    /// Failures are not retried; a partial download never replaces the target.
    pub fn ensure(&self, file: &str) -> Result<PathBuf, CacheError> {
        let target = self.local_path(file);
        if target.exists() {
            tracing::info!(path = %target.display(), "using cached model");
            return Ok(target);
        }

        let url = self.url_for(file);
        tracing::info!(%url, "downloading model");
        self.download(&url, file, &target)?;
        Ok(target)
    }

    fn download(&self, url: &str, file: &str, target: &Path) -> Result<(), CacheError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let response = ureq::get(url).call().map_err(|e| CacheError::Download {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let content_length: Option<u64> = response
            .header("Content-Length")
            .and_then(|s| s.parse().ok());

        let temp_path = target.with_extension("part");
        let mut out = fs::File::create(&temp_path)?;
        let copied = std::io::copy(&mut response.into_reader(), &mut out);
        let actual = match copied {
            Ok(n) => n,
            Err(e) => {
                fs::remove_file(&temp_path).ok();
                return Err(CacheError::Download {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        out.flush()?;
        drop(out);

        if let Some(expected) = content_length {
            if actual != expected {
                fs::remove_file(&temp_path).ok();
                return Err(CacheError::Incomplete {
                    file: file.to_string(),
                    expected,
                    actual,
                });
            }
        }

        fs::rename(&temp_path, target)?;
        tracing::info!(path = %target.display(), bytes = actual, "model downloaded");
        Ok(())
    }
}
