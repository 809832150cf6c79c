//! Identity embedding persistence as safetensors files.
//!
//! Each identity lives in `<dir>/<name>.safetensors` holding a single F32
//! tensor named `embedding` plus string metadata. The container is
//! self-describing, so records stay readable from any safetensors reader.

use crate::types::{Embedding, IdentityRecord, IdentityVector};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const EMBEDDING_TENSOR: &str = "embedding";
const EXTENSION: &str = "safetensors";

const META_SAMPLES: &str = "samples";
const META_CREATED_AT: &str = "created_at";
const META_MODEL_VERSION: &str = "model_version";
const META_NORMALIZATION: &str = "normalization";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid identity name: {0:?}")]
    InvalidName(String),
    #[error("identity record not found: {0}")]
    NotFound(String),
    #[error("identity {0:?} already exists; remove it first")]
    AlreadyExists(String),
    #[error("malformed identity record: {0}")]
    Format(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Named, durable identity embeddings.
pub trait EmbeddingStore: Send + Sync {
    /// Persist a new record. Existing names are rejected with `AlreadyExists`.
    fn save(&self, record: &IdentityRecord) -> Result<(), StoreError>;
    fn load(&self, name: &str) -> Result<IdentityRecord, StoreError>;
    fn exists(&self, name: &str) -> bool;
    /// Names of all stored identities, sorted.
    fn list(&self) -> Result<Vec<String>, StoreError>;
    fn remove(&self, name: &str) -> Result<(), StoreError>;
}

/// Reject names that could escape the store directory or collide with temp files.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Directory of safetensors identity records.
pub struct SafetensorsStore {
    dir: PathBuf,
}

impl SafetensorsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{EXTENSION}")))
    }
}

impl EmbeddingStore for SafetensorsStore {
    fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.name)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(record.name.clone()));
        }
        let embedding = record.vector.embedding();

        let mut metadata = HashMap::new();
        metadata.insert(META_SAMPLES.to_string(), record.samples.to_string());
        metadata.insert(META_CREATED_AT.to_string(), record.created_at.clone());
        metadata.insert(
            META_NORMALIZATION.to_string(),
            if record.vector.is_normalized() { "unit" } else { "raw" }.to_string(),
        );
        if let Some(version) = &record.model_version {
            metadata.insert(META_MODEL_VERSION.to_string(), version.clone());
        }

        let bytes = f32_to_le_bytes(&embedding.values);
        let view = TensorView::new(Dtype::F32, vec![embedding.dim()], &bytes)
            .map_err(|e| StoreError::Format(e.to_string()))?;
        let serialized = safetensors::serialize([(EMBEDDING_TENSOR, view)], &Some(metadata))
            .map_err(|e| StoreError::Format(e.to_string()))?;

        std::fs::create_dir_all(&self.dir)?;
        write_atomic(&path, &serialized)?;

        tracing::info!(
            name = %record.name,
            dim = embedding.dim(),
            samples = record.samples,
            path = %path.display(),
            "identity embedding saved"
        );
        Ok(())
    }

    fn load(&self, name: &str) -> Result<IdentityRecord, StoreError> {
        let path = self.path_for(name)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let (_, values) = read_f32_tensor(&bytes, EMBEDDING_TENSOR)?;
        let (_, header) =
            SafeTensors::read_metadata(&bytes).map_err(|e| StoreError::Format(e.to_string()))?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let samples = metadata
            .get(META_SAMPLES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let model_version = metadata.get(META_MODEL_VERSION).cloned();
        let embedding = Embedding {
            values,
            model_version: model_version.clone(),
        };
        let vector = match metadata.get(META_NORMALIZATION).map(String::as_str) {
            Some("unit") => IdentityVector::Normalized(embedding),
            _ => IdentityVector::Raw(embedding),
        };

        tracing::debug!(name, dim = vector.embedding().dim(), "identity embedding loaded");

        Ok(IdentityRecord {
            name: name.to_string(),
            vector,
            samples,
            created_at: metadata.get(META_CREATED_AT).cloned().unwrap_or_default(),
            model_version,
        })
    }

    fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == EXTENSION))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .filter(|name| validate_name(name).is_ok())
            .collect();
        names.sort();
        Ok(names)
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(name, "identity embedding removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Write through `<path>.tmp` and rename; the temp file never outlives a failure.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let written = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, path));
    if written.is_err() {
        std::fs::remove_file(&tmp).ok();
    }
    written
}

fn f32_to_le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Read a named F32 tensor from serialized safetensors bytes as `(shape, values)`.
pub(crate) fn read_f32_tensor(bytes: &[u8], name: &str) -> Result<(Vec<usize>, Vec<f32>), StoreError> {
    let tensors = SafeTensors::deserialize(bytes).map_err(|e| StoreError::Format(e.to_string()))?;
    let tensor = tensors
        .tensor(name)
        .map_err(|e| StoreError::Format(format!("tensor {name:?}: {e}")))?;
    if tensor.dtype() != Dtype::F32 {
        return Err(StoreError::Format(format!(
            "tensor {name:?} has dtype {:?}, expected F32",
            tensor.dtype()
        )));
    }
    let values = tensor
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((tensor.shape().to_vec(), values))
}
