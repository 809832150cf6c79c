//! GPEN face restoration via ONNX Runtime.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

const GPEN_HALF_RANGE: f32 = 127.5;

#[derive(Error, Debug)]
pub enum RestorerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("cannot restore an empty patch")]
    EmptyPatch,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Enhances a face patch, returning an image of the same dimensions.
pub trait FaceRestorer: Send + Sync {
    fn restore(&self, patch: &RgbImage) -> Result<RgbImage, RestorerError>;
}

/// GPEN-BFR restoration network with a fixed square input.
pub struct GpenRestorer {
    session: Mutex<Session>,
    input_size: usize,
}

impl GpenRestorer {
    pub fn load(model_path: &Path, input_size: usize, intra_threads: usize) -> Result<Self, RestorerError> {
        if !model_path.exists() {
            return Err(RestorerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            input_size,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded GPEN model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
        })
    }
}

impl FaceRestorer for GpenRestorer {
    fn restore(&self, patch: &RgbImage) -> Result<RgbImage, RestorerError> {
        let (w, h) = patch.dimensions();
        if w == 0 || h == 0 {
            return Err(RestorerError::EmptyPatch);
        }

        let size = self.input_size as u32;
        let resized = imageops::resize(patch, size, size, FilterType::Triangle);
        let input = preprocess(&resized);

        let raw: Vec<f32> = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| RestorerError::InferenceFailed(format!("restoration output: {e}")))?;
            data.to_vec()
        };

        let restored = postprocess(&raw, self.input_size)?;
        Ok(imageops::resize(&restored, w, h, FilterType::Triangle))
    }
}

/// RGB → NCHW in [-1, 1].
///
/// GPEN-BFR was trained on RGB input; channels are deliberately not swapped to BGR.
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel.0[c] as f32 / GPEN_HALF_RANGE - 1.0;
        }
    }
    tensor
}

/// NCHW in [-1, 1] → RGB, clipped and truncated.
fn postprocess(data: &[f32], size: usize) -> Result<RgbImage, RestorerError> {
    let plane = size * size;
    if data.len() != 3 * plane {
        return Err(RestorerError::InferenceFailed(format!(
            "expected {} output values, got {}",
            3 * plane,
            data.len()
        )));
    }
    Ok(RgbImage::from_fn(size as u32, size as u32, |x, y| {
        let i = y as usize * size + x as usize;
        Rgb(std::array::from_fn(|c| {
            ((data[c * plane + i] + 1.0) * GPEN_HALF_RANGE).clamp(0.0, 255.0) as u8
        }))
    }))
}
