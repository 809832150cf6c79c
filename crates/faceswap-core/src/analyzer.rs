//! Face analysis: detection followed by per-face embedding extraction.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Finds faces in a frame and attaches an identity embedding to each.
///
/// Faces are returned in detector order (highest confidence first).
pub trait FaceAnalyzer: Send + Sync {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError>;
}

/// SCRFD detection + ArcFace recognition.
pub struct ScrfdArcFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl ScrfdArcFaceAnalyzer {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }
}

impl FaceAnalyzer for ScrfdArcFaceAnalyzer {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let boxes = self.detector.detect(image)?;

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = match self.recognizer.extract(image, &bbox) {
                Ok(embedding) => Some(embedding),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::warn!(
                        x = bbox.x,
                        y = bbox.y,
                        "detected face has no landmarks; embedding unavailable"
                    );
                    None
                }
                Err(e) => return Err(e.into()),
            };
            faces.push(DetectedFace { bbox, embedding });
        }

        Ok(faces)
    }
}
