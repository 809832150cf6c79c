//! Model provider: resolves, loads and shares the inference models.
//!
//! Nothing is loaded when a [`ModelProvider`] is constructed. The first call
//! to [`ModelProvider::load`] (or any accessor) initializes all models; under
//! concurrent first use exactly one caller performs the load while the others
//! wait for it, then every caller sees the same handles.

use crate::analyzer::{FaceAnalyzer, ScrfdArcFaceAnalyzer};
use crate::cache::{CacheError, ModelCache};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::restorer::{FaceRestorer, GpenRestorer, RestorerError};
use crate::swapper::{FaceSwapper, InSwapper, SwapperError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model cache: {0}")]
    Cache(#[from] CacheError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("swapper: {0}")]
    Swapper(#[from] SwapperError),
    #[error("restorer: {0}")]
    Restorer(#[from] RestorerError),
}

/// Where the models come from and how they are run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model repository, e.g. `org/name` on the endpoint.
    pub repo: String,
    pub endpoint: String,
    /// Local cache directory for downloaded artifacts.
    pub cache_dir: PathBuf,
    pub detector_file: String,
    pub recognizer_file: String,
    pub swapper_file: String,
    /// safetensors file holding the swapper's `emap` projection.
    pub swapper_emap_file: String,
    pub restorer_file: String,
    /// SCRFD square input size (320 or 640).
    pub detection_size: usize,
    pub restore_enabled: bool,
    /// Restoration network's fixed square input size.
    pub restore_size: usize,
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            repo: "asadujjaman-emon/face-app-models".to_string(),
            endpoint: "https://huggingface.co".to_string(),
            cache_dir: PathBuf::from("models"),
            detector_file: "det_10g.onnx".to_string(),
            recognizer_file: "w600k_r50.onnx".to_string(),
            swapper_file: "inswapper_128.onnx".to_string(),
            swapper_emap_file: "inswapper_128_emap.safetensors".to_string(),
            restorer_file: "GPEN-BFR-1024.onnx".to_string(),
            detection_size: 320,
            restore_enabled: true,
            restore_size: 1024,
            intra_threads: 2,
        }
    }
}

impl ModelConfig {
    pub fn cache(&self) -> ModelCache {
        ModelCache::new(&self.endpoint, &self.repo, &self.cache_dir)
    }

    /// Artifact file names required by this configuration.
    pub fn required_files(&self) -> Vec<&str> {
        let mut files = vec![
            self.detector_file.as_str(),
            self.recognizer_file.as_str(),
            self.swapper_file.as_str(),
            self.swapper_emap_file.as_str(),
        ];
        if self.restore_enabled {
            files.push(self.restorer_file.as_str());
        }
        files
    }
}

/// Long-lived model handles.
pub struct LoadedModels {
    pub analyzer: Box<dyn FaceAnalyzer>,
    pub swapper: Box<dyn FaceSwapper>,
    /// `None` when restoration is disabled.
    pub restorer: Option<Box<dyn FaceRestorer>>,
}

/// Produces a complete set of model handles, or fails without partial state.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<LoadedModels, ModelLoadError>;
}

/// Loads ONNX models, downloading missing artifacts into the cache first.
pub struct OnnxModelLoader {
    config: ModelConfig,
}

impl OnnxModelLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Download every required artifact without loading any session.
    pub fn fetch_all(&self) -> Result<Vec<PathBuf>, ModelLoadError> {
        let cache = self.config.cache();
        self.config
            .required_files()
            .into_iter()
            .map(|file| cache.ensure(file).map_err(ModelLoadError::from))
            .collect()
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self) -> Result<LoadedModels, ModelLoadError> {
        let cfg = &self.config;
        let cache = cfg.cache();

        let detector_path = cache.ensure(&cfg.detector_file)?;
        let recognizer_path = cache.ensure(&cfg.recognizer_file)?;
        let swapper_path = cache.ensure(&cfg.swapper_file)?;
        let emap_path = cache.ensure(&cfg.swapper_emap_file)?;

        let detector = FaceDetector::load(&detector_path, cfg.detection_size, cfg.intra_threads)?;
        let recognizer = FaceRecognizer::load(&recognizer_path, cfg.intra_threads)?;
        let swapper = InSwapper::load(&swapper_path, &emap_path, cfg.intra_threads)?;

        let restorer: Option<Box<dyn FaceRestorer>> = if cfg.restore_enabled {
            let restorer_path = cache.ensure(&cfg.restorer_file)?;
            Some(Box::new(GpenRestorer::load(
                &restorer_path,
                cfg.restore_size,
                cfg.intra_threads,
            )?))
        } else {
            tracing::info!("restoration disabled; GPEN model not loaded");
            None
        };

        Ok(LoadedModels {
            analyzer: Box::new(ScrfdArcFaceAnalyzer::new(detector, recognizer)),
            swapper: Box::new(swapper),
            restorer,
        })
    }
}

/// Lazily initialized, shared model handles.
pub struct ModelProvider<L = OnnxModelLoader> {
    loader: L,
    models: OnceCell<LoadedModels>,
}

impl<L: ModelLoader> ModelProvider<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            models: OnceCell::new(),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn is_loaded(&self) -> bool {
        self.models.get().is_some()
    }

    /// Load all models once; later calls return the same handles.
    ///
    /// A failed load leaves the provider uninitialized.
    pub fn load(&self) -> Result<&LoadedModels, ModelLoadError> {
        self.models.get_or_try_init(|| {
            let start = Instant::now();
            tracing::info!("loading models");
            let models = match self.loader.load() {
                Ok(models) => models,
                Err(e) => {
                    tracing::error!(error = %e, "model load failed");
                    return Err(e);
                }
            };
            tracing::info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                restoration = models.restorer.is_some(),
                "models loaded"
            );
            Ok(models)
        })
    }

    pub fn analyzer(&self) -> Result<&dyn FaceAnalyzer, ModelLoadError> {
        Ok(self.load()?.analyzer.as_ref())
    }

    pub fn swapper(&self) -> Result<&dyn FaceSwapper, ModelLoadError> {
        Ok(self.load()?.swapper.as_ref())
    }

    pub fn restorer(&self) -> Result<Option<&dyn FaceRestorer>, ModelLoadError> {
        Ok(self.load()?.restorer.as_deref())
    }
}
