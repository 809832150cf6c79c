//! inswapper face swap network via ONNX Runtime.
//!
//! The target face is aligned to a 128×128 crop, the network renders the
//! source identity into that crop, and the result is pasted back into the
//! full frame through the inverse alignment transform.

use crate::alignment::{self, sample_bilinear, Similarity};
use crate::store::read_f32_tensor;
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

const INSWAPPER_INPUT_SIZE: usize = 128;
const INSWAPPER_LATENT_DIM: usize = 512;
/// Name of the projection tensor inside the companion safetensors file.
const EMAP_TENSOR: &str = "emap";
/// Paste-back mask falls off linearly over this fraction of the crop size.
const PASTE_FALLOFF_FRACTION: f32 = 0.1;

#[derive(Error, Debug)]
pub enum SwapperError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid embedding projection: {0}")]
    InvalidEmap(String),
    #[error("target face has no landmarks")]
    NoLandmarks,
    #[error("source embedding has {actual} dims, expected {expected}")]
    EmbeddingDimension { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Replaces one face in a frame with the identity carried by an embedding.
///
/// Implementations return the full frame with the swapped face already
/// pasted back at the target's location and pose.
pub trait FaceSwapper: Send + Sync {
    fn swap(
        &self,
        image: &RgbImage,
        target: &BoundingBox,
        source: &Embedding,
    ) -> Result<RgbImage, SwapperError>;
}

/// inswapper_128 swap network.
pub struct InSwapper {
    session: Mutex<Session>,
    /// Row-major `[512, 512]` projection from ArcFace space to the swap latent.
    emap: Array2<f32>,
}

impl InSwapper {
    /// Load the swap network and its embedding projection.
    pub fn load(model_path: &Path, emap_path: &Path, intra_threads: usize) -> Result<Self, SwapperError> {
        if !model_path.exists() {
            return Err(SwapperError::ModelNotFound(model_path.display().to_string()));
        }

        let bytes = std::fs::read(emap_path)
            .map_err(|e| SwapperError::InvalidEmap(format!("{}: {e}", emap_path.display())))?;
        let (shape, values) = read_f32_tensor(&bytes, EMAP_TENSOR)
            .map_err(|e| SwapperError::InvalidEmap(format!("{}: {e}", emap_path.display())))?;
        if shape != [INSWAPPER_LATENT_DIM, INSWAPPER_LATENT_DIM] {
            return Err(SwapperError::InvalidEmap(format!(
                "expected shape [{INSWAPPER_LATENT_DIM}, {INSWAPPER_LATENT_DIM}], got {shape:?}"
            )));
        }
        let emap = Array2::from_shape_vec((INSWAPPER_LATENT_DIM, INSWAPPER_LATENT_DIM), values)
            .map_err(|e| SwapperError::InvalidEmap(e.to_string()))?;

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            emap = %emap_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded inswapper model"
        );

        Ok(Self {
            session: Mutex::new(session),
            emap,
        })
    }

    fn latent(&self, source: &Embedding) -> Result<Array2<f32>, SwapperError> {
        project_latent(&self.emap, source)
    }
}

impl FaceSwapper for InSwapper {
    fn swap(
        &self,
        image: &RgbImage,
        target: &BoundingBox,
        source: &Embedding,
    ) -> Result<RgbImage, SwapperError> {
        let landmarks = target.landmarks.as_ref().ok_or(SwapperError::NoLandmarks)?;
        let latent = self.latent(source)?;

        let (aligned, to_crop) = alignment::align_face(image, landmarks, INSWAPPER_INPUT_SIZE);
        let blob = crop_to_blob(&aligned);

        let raw: Vec<f32> = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![
                TensorRef::from_array_view(blob.view())?,
                TensorRef::from_array_view(latent.view())?
            ])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| SwapperError::InferenceFailed(format!("swap output: {e}")))?;
            data.to_vec()
        };

        let swapped = blob_to_crop(&raw, INSWAPPER_INPUT_SIZE)?;
        Ok(paste_back(image, &swapped, &to_crop))
    }
}

/// `normalize(embedding · emap)` as a `[1, 512]` tensor.
fn project_latent(emap: &Array2<f32>, source: &Embedding) -> Result<Array2<f32>, SwapperError> {
    if source.dim() != emap.nrows() {
        return Err(SwapperError::EmbeddingDimension {
            expected: emap.nrows(),
            actual: source.dim(),
        });
    }
    let row = Array2::from_shape_vec((1, source.dim()), source.values.clone())
        .map_err(|e| SwapperError::InferenceFailed(e.to_string()))?;
    let mut latent = row.dot(emap);
    let norm = latent.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        latent.mapv_inplace(|v| v / norm);
    }
    Ok(latent)
}

/// RGB crop → NCHW tensor scaled to [0, 1].
fn crop_to_blob(crop: &RgbImage) -> Array4<f32> {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let mut blob = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            blob[[0, c, y as usize, x as usize]] = pixel.0[c] as f32 / 255.0;
        }
    }
    blob
}

/// NCHW tensor in [0, 1] → RGB crop.
fn blob_to_crop(data: &[f32], size: usize) -> Result<RgbImage, SwapperError> {
    let plane = size * size;
    if data.len() != 3 * plane {
        return Err(SwapperError::InferenceFailed(format!(
            "expected {} output values, got {}",
            3 * plane,
            data.len()
        )));
    }
    Ok(RgbImage::from_fn(size as u32, size as u32, |x, y| {
        let i = y as usize * size + x as usize;
        Rgb(std::array::from_fn(|c| {
            (data[c * plane + i] * 255.0).round().clamp(0.0, 255.0) as u8
        }))
    }))
}

/// Weight of a crop-space position: 1 in the interior, falling to 0 at the crop border.
fn crop_mask_weight(cx: f32, cy: f32, size: f32) -> f32 {
    let edge = cx.min(cy).min(size - 1.0 - cx).min(size - 1.0 - cy);
    let falloff = size * PASTE_FALLOFF_FRACTION;
    (edge / falloff).clamp(0.0, 1.0)
}

/// Inverse-warp the swapped crop into a copy of the frame.
fn paste_back(frame: &RgbImage, crop: &RgbImage, to_crop: &Similarity) -> RgbImage {
    let mut out = frame.clone();
    let Some(to_frame) = to_crop.inverse() else {
        tracing::warn!("degenerate alignment transform; frame left unchanged");
        return out;
    };

    // Frame-space footprint of the crop.
    let size = crop.width() as f32;
    let corners = [(0.0, 0.0), (size, 0.0), (0.0, size), (size, size)]
        .map(|(x, y)| to_frame.apply(x, y));
    let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let max_x = (corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max).ceil() as i64)
        .clamp(0, frame.width() as i64) as u32;
    let max_y = (corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max).ceil() as i64)
        .clamp(0, frame.height() as i64) as u32;

    for y in min_y..max_y {
        for x in min_x..max_x {
            let (cx, cy) = to_crop.apply(x as f32, y as f32);
            if cx < 0.0 || cy < 0.0 || cx > size - 1.0 || cy > size - 1.0 {
                continue;
            }
            let alpha = crop_mask_weight(cx, cy, size);
            if alpha <= 0.0 {
                continue;
            }
            let swapped = sample_bilinear(crop, cx, cy);
            let pixel = out.get_pixel_mut(x, y);
            for c in 0..3 {
                let blended = swapped[c] * alpha + pixel.0[c] as f32 * (1.0 - alpha);
                pixel.0[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}
