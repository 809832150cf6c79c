//! SCRFD face detector via ONNX Runtime.
//!
//! The frame is scaled to fit the square network input with its aspect ratio
//! kept and anchored at the top-left corner; the remainder is zero padding.
//! Each of the three stride heads predicts, per anchor, a score, the distances
//! from the anchor centre to the box edges and five landmark offsets, all in
//! stride units. Candidates above the score threshold are merged by greedy NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const LANDMARKS: usize = 5;

/// Detection input sizes the SCRFD exports are deployed with.
pub const SUPPORTED_INPUT_SIZES: [usize; 2] = [320, 640];

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported detection size {0} (expected 320 or 640)")]
    UnsupportedInputSize(usize),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Mapping between frame pixels and network input pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    width: usize,
    height: usize,
}

impl Letterbox {
    fn fit(frame_width: u32, frame_height: u32, input_size: usize) -> Self {
        let side = input_size as f32;
        let (w, h) = (frame_width as f32, frame_height as f32);
        let (width, height) = if h / w > 1.0 {
            (((side * w / h) as usize).max(1), input_size)
        } else {
            (input_size, ((side * h / w) as usize).max(1))
        };
        Self {
            scale: height as f32 / h,
            width,
            height,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (x / self.scale, y / self.scale)
    }
}

/// Output tensor positions of one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    stride: usize,
    score: usize,
    bbox: usize,
    kps: usize,
}

impl StrideHead {
    /// Decode every anchor of this level scoring above `threshold`.
    fn decode(
        &self,
        scores: &[f32],
        distances: &[f32],
        offsets: &[f32],
        input_size: usize,
        letterbox: &Letterbox,
        threshold: f32,
    ) -> Vec<BoundingBox> {
        let cells = input_size / self.stride;
        let anchors = cells * cells * ANCHORS_PER_CELL;
        let step = self.stride as f32;

        let mut found = Vec::new();
        for (anchor, &score) in scores.iter().enumerate().take(anchors) {
            if score < threshold {
                continue;
            }
            let Some(d) = distances.get(anchor * 4..anchor * 4 + 4) else {
                continue;
            };
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cells) as f32 * step;
            let cy = (cell / cells) as f32 * step;

            let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);
            let mut face = BoundingBox::from_corners(x1, y1, x2, y2, score);

            let span = LANDMARKS * 2;
            face.landmarks = offsets
                .get(anchor * span..(anchor + 1) * span)
                .map(|k| std::array::from_fn(|i| letterbox.to_frame(cx + k[2 * i] * step, cy + k[2 * i + 1] * step)));
            found.push(face);
        }
        found
    }
}

/// SCRFD face detector.
pub struct FaceDetector {
    session: Mutex<Session>,
    input_size: usize,
    heads: [StrideHead; 3],
}

impl FaceDetector {
    /// Load the SCRFD model for a square input of `input_size` pixels.
    pub fn load(model_path: &Path, input_size: usize, intra_threads: usize) -> Result<Self, DetectorError> {
        if !SUPPORTED_INPUT_SIZES.contains(&input_size) {
            return Err(DetectorError::UnsupportedInputSize(input_size));
        }
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            input_size,
            outputs = ?names,
            "loaded SCRFD model"
        );

        if names.len() < STRIDES.len() * 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD export with landmarks has 9 outputs, this one has {}",
                names.len()
            )));
        }
        let heads = stride_heads(&names);

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            heads,
        })
    }

    /// Faces in `image`, highest score first.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(image.width(), image.height(), self.input_size);
        let input = preprocess(image, &letterbox, self.input_size);

        let mut candidates = Vec::new();
        {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            for head in &self.heads {
                let tensor = |index: usize, what: &str| {
                    outputs[index]
                        .try_extract_tensor::<f32>()
                        .map(|(_, data)| data)
                        .map_err(|e| DetectorError::InferenceFailed(format!("{what} @ stride {}: {e}", head.stride)))
                };
                let scores = tensor(head.score, "scores")?;
                let distances = tensor(head.bbox, "boxes")?;
                let offsets = tensor(head.kps, "landmarks")?;
                candidates.extend(head.decode(
                    scores,
                    distances,
                    offsets,
                    self.input_size,
                    &letterbox,
                    SCORE_THRESHOLD,
                ));
            }
        }

        let faces = nms(candidates, NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

/// Scaled frame in the top-left corner of a zeroed NCHW tensor.
fn preprocess(image: &RgbImage, letterbox: &Letterbox, input_size: usize) -> Array4<f32> {
    let resized = imageops::resize(
        image,
        letterbox.width as u32,
        letterbox.height as u32,
        FilterType::Triangle,
    );
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, &v) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = (v as f32 - PIXEL_MEAN) / PIXEL_SCALE;
        }
    }
    tensor
}

/// Match outputs named `score_8`, `bbox_16`, `kps_32`, ... to stride levels.
///
/// Exports with anonymous outputs use the conventional order: three score
/// tensors, then three box tensors, then three landmark tensors.
fn stride_heads(names: &[String]) -> [StrideHead; 3] {
    let position = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));
    let by_name = |level: usize| -> Option<StrideHead> {
        let stride = STRIDES[level];
        Some(StrideHead {
            stride,
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    };
    let positional = |level: usize| StrideHead {
        stride: STRIDES[level],
        score: level,
        bbox: level + 3,
        kps: level + 6,
    };

    match (by_name(0), by_name(1), by_name(2)) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "SCRFD outputs unnamed; assuming positional layout");
            [positional(0), positional(1), positional(2)]
        }
    }
}

/// Greedy non-maximum suppression; the result is ordered by descending score.
fn nms(mut candidates: Vec<BoundingBox>, threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let (ax1, ay1, ax2, ay2) = a.corners();
    let (bx1, by1, bx2, by2) = b.corners();
    let w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let overlap = w * h;
    let union = a.width * a.height + b.width * b.height - overlap;
    if union > 0.0 {
        overlap / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn square(x: f32, y: f32, side: f32, score: f32) -> BoundingBox {
        BoundingBox::from_corners(x, y, x + side, y + side, score)
    }

    #[test]
    fn test_iou() {
        let a = square(0.0, 0.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &square(20.0, 20.0, 10.0, 1.0)), 0.0);
        // 5x10 overlap of two 10x10 boxes.
        let b = square(5.0, 0.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                square(5.0, 5.0, 100.0, 0.8),
                square(200.0, 200.0, 50.0, 0.7),
                square(0.0, 0.0, 100.0, 0.9),
            ],
            NMS_THRESHOLD,
        );
        let scores: Vec<f32> = kept.iter().map(|f| f.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
        assert!(nms(Vec::new(), NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_letterbox_fit() {
        let wide = Letterbox::fit(640, 320, 320);
        assert_eq!((wide.width, wide.height), (320, 160));
        assert!((wide.scale - 0.5).abs() < 1e-6);

        let tall = Letterbox::fit(100, 400, 320);
        assert_eq!((tall.width, tall.height), (80, 320));
        assert!((tall.scale - 0.8).abs() < 1e-6);
        let (x, y) = tall.to_frame(8.0, 16.0);
        assert!((x - 10.0).abs() < 1e-4 && (y - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_places_frame_top_left() {
        let image = RgbImage::from_pixel(640, 320, Rgb([255, 0, 128]));
        let letterbox = Letterbox::fit(640, 320, 320);
        let tensor = preprocess(&image, &letterbox, 320);
        assert_eq!(tensor.shape(), &[1, 3, 320, 320]);

        assert!((tensor[[0, 0, 10, 10]] - (255.0 - PIXEL_MEAN) / PIXEL_SCALE).abs() < 1e-2);
        assert!((tensor[[0, 1, 10, 10]] - (0.0 - PIXEL_MEAN) / PIXEL_SCALE).abs() < 1e-2);
        // Rows below the scaled frame are padding.
        assert_eq!(tensor[[0, 0, 200, 10]], 0.0);
    }

    #[test]
    fn test_decode_maps_back_to_frame() {
        // 64px input, stride 32: a 2x2 grid with two anchors per cell.
        let head = StrideHead { stride: 32, score: 0, bbox: 1, kps: 2 };
        let anchors = 2 * 2 * ANCHORS_PER_CELL;
        let hit = 3 * ANCHORS_PER_CELL; // cell (1, 1), centre (32, 32)

        let mut scores = vec![0.1f32; anchors];
        scores[hit] = 0.9;
        let mut distances = vec![0.0f32; anchors * 4];
        distances[hit * 4..hit * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        let mut offsets = vec![0.0f32; anchors * 10];
        offsets[hit * 10] = 0.25;

        let letterbox = Letterbox { scale: 0.5, width: 64, height: 64 };
        let faces = head.decode(&scores, &distances, &offsets, 64, &letterbox, SCORE_THRESHOLD);

        assert_eq!(faces.len(), 1);
        // (16,16)-(48,48) at input scale.
        let (x1, y1, x2, y2) = faces[0].corners();
        assert_eq!((x1, y1, x2, y2), (32.0, 32.0, 96.0, 96.0));
        let landmarks = faces[0].landmarks.unwrap();
        assert_eq!(landmarks[0], (80.0, 64.0));
        assert_eq!(landmarks[4], (64.0, 64.0));
    }

    #[test]
    fn test_decode_tolerates_short_outputs() {
        let head = StrideHead { stride: 32, score: 0, bbox: 1, kps: 2 };
        let letterbox = Letterbox { scale: 1.0, width: 64, height: 64 };
        let faces = head.decode(&[0.9; 8], &[0.0; 4], &[], 64, &letterbox, SCORE_THRESHOLD);
        assert_eq!(faces.len(), 1);
        assert!(faces[0].landmarks.is_none());
    }

    #[test]
    fn test_stride_heads_by_name() {
        let names: Vec<String> = ["bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let heads = stride_heads(&names);
        assert_eq!(heads[0], StrideHead { stride: 8, score: 2, bbox: 0, kps: 1 });
        assert_eq!(heads[2], StrideHead { stride: 32, score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_stride_heads_positional() {
        let names: Vec<String> = (0..9).map(|i| format!("output_{i}")).collect();
        let heads = stride_heads(&names);
        assert_eq!(heads[1], StrideHead { stride: 16, score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_load_validates_before_touching_disk() {
        let err = FaceDetector::load(Path::new("/nonexistent/det.onnx"), 512, 1).err();
        assert!(matches!(err, Some(DetectorError::UnsupportedInputSize(512))));
        let err = FaceDetector::load(Path::new("/nonexistent/det.onnx"), 320, 1).err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
