//! faceswap-core: Face swap engine.
//!
//! SCRFD detection and ArcFace recognition find and describe faces, the
//! inswapper network replaces them with a stored identity, and GPEN
//! restoration plus histogram matching and feathered blending composite the
//! result back into the frame. All networks run on ONNX Runtime.

pub mod alignment;
pub mod analyzer;
pub mod cache;
pub mod codec;
pub mod compositor;
pub mod detector;
pub mod enroll;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod recognizer;
pub mod restorer;
pub mod store;
pub mod swapper;
pub mod types;

pub use analyzer::{FaceAnalyzer, ScrfdArcFaceAnalyzer};
pub use compositor::Compositor;
pub use error::PipelineError;
pub use models::{ModelConfig, ModelProvider, OnnxModelLoader};
pub use pipeline::{FaceIsolation, FacePipeline, IdentityRef, SwapReport};
pub use restorer::FaceRestorer;
pub use store::{EmbeddingStore, SafetensorsStore};
pub use swapper::FaceSwapper;
pub use types::{BoundingBox, DetectedFace, Embedding, IdentityRecord, IdentityVector, Region};
