use anyhow::{bail, Context, Result};
use faceswap_core::{Compositor, FaceIsolation, ModelConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration: optional TOML file, then `FACESWAP_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models: ModelConfig,
    /// Directory of stored identity embeddings.
    pub store_dir: PathBuf,
    pub compositor: Compositor,
    pub isolation: FaceIsolation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: ModelConfig::default(),
            store_dir: default_data_dir().join("identities"),
            compositor: Compositor::default(),
            isolation: FaceIsolation::default(),
        }
    }
}

impl Config {
    /// Load from `path` (or `FACESWAP_CONFIG`), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FACESWAP_CONFIG").map(PathBuf::from));

        let mut config = match &path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACESWAP_*` overrides read through `get`.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let m = &mut self.models;
        if let Some(v) = get("FACESWAP_MODEL_REPO") {
            m.repo = v;
        }
        if let Some(v) = get("FACESWAP_MODEL_ENDPOINT") {
            m.endpoint = v;
        }
        if let Some(v) = get("FACESWAP_MODEL_DIR") {
            m.cache_dir = PathBuf::from(v);
        }
        m.detection_size = parse_or(&get, "FACESWAP_DETECTION_SIZE", m.detection_size);
        m.restore_size = parse_or(&get, "FACESWAP_RESTORE_SIZE", m.restore_size);
        m.intra_threads = parse_or(&get, "FACESWAP_INTRA_THREADS", m.intra_threads);
        if let Some(v) = get("FACESWAP_RESTORE_ENABLED") {
            m.restore_enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }

        if let Some(v) = get("FACESWAP_STORE_DIR") {
            self.store_dir = PathBuf::from(v);
        }
        self.compositor.enlarge_scale = parse_or(&get, "FACESWAP_ENLARGE_SCALE", self.compositor.enlarge_scale);
        self.compositor.feather = parse_or(&get, "FACESWAP_FEATHER", self.compositor.feather);
        if let Some(v) = get("FACESWAP_ISOLATION") {
            match v.to_ascii_lowercase().as_str() {
                "sequential" => self.isolation = FaceIsolation::Sequential,
                "snapshot" => self.isolation = FaceIsolation::Snapshot,
                other => tracing::warn!(value = other, "ignoring unknown FACESWAP_ISOLATION"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.models.detection_size, 320 | 640) {
            bail!(
                "detection_size must be 320 or 640, got {}",
                self.models.detection_size
            );
        }
        if !self.compositor.enlarge_scale.is_finite() || self.compositor.enlarge_scale < 1.0 {
            bail!(
                "enlarge_scale must be at least 1.0, got {}",
                self.compositor.enlarge_scale
            );
        }
        if self.models.restore_size == 0 {
            bail!("restore_size must be positive");
        }
        if self.models.intra_threads == 0 {
            bail!("intra_threads must be positive");
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match get(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            current
        }),
        None => current,
    }
}

/// `$XDG_DATA_HOME/faceswap`, falling back to `~/.local/share/faceswap`.
fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceswap")
}
