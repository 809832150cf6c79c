use crate::analyzer::AnalyzerError;
use crate::codec::CodecError;
use crate::compositor::CompositeError;
use crate::models::ModelLoadError;
use crate::store::StoreError;
use thiserror::Error;

/// Failures surfaced by the swap and enrollment operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("model initialization failed: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("no face found in any input image")]
    NoFaceFound,
    #[error("no embedding record found for identity {0:?}")]
    MissingEmbeddingRecord(String),
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
    #[error("identity embeddings disagree in dimension: {expected} vs {actual}")]
    EmbeddingDimension { expected: usize, actual: usize },
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("compositing failed: {0}")]
    Composite(#[from] CompositeError),
    #[error("embedding store: {0}")]
    Store(StoreError),
    #[error("image codec: {0}")]
    Codec(CodecError),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => PipelineError::MissingEmbeddingRecord(name),
            other => PipelineError::Store(other),
        }
    }
}

impl From<CodecError> for PipelineError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Unsupported(_) | CodecError::Base64(_) | CodecError::Decode(_) => {
                PipelineError::UnsupportedInput(e.to_string())
            }
            other => PipelineError::Codec(other),
        }
    }
}
