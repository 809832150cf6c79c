use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Build a box from corner coordinates.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
            landmarks: None,
        }
    }

    /// Corner coordinates `(x1, y1, x2, y2)`.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (self.x, self.y, self.x + self.width, self.y + self.height)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Unit-length copy. A zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// One face found by the analyzer.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    /// `None` when the recognizer could not produce an embedding for this face.
    pub embedding: Option<Embedding>,
}

/// Identity vector with its normalization state made explicit.
///
/// Stored identities are the arithmetic mean of per-image unit embeddings and
/// are therefore *not* unit length. Readers normalize exactly once through
/// [`IdentityVector::into_normalized`]; a vector already marked `Normalized`
/// passes through untouched.
#[derive(Debug, Clone)]
pub enum IdentityVector {
    Raw(Embedding),
    Normalized(Embedding),
}

impl IdentityVector {
    pub fn embedding(&self) -> &Embedding {
        match self {
            IdentityVector::Raw(e) | IdentityVector::Normalized(e) => e,
        }
    }

    pub fn is_normalized(&self) -> bool {
        matches!(self, IdentityVector::Normalized(_))
    }

    pub fn into_normalized(self) -> Embedding {
        match self {
            IdentityVector::Raw(e) => e.normalized(),
            IdentityVector::Normalized(e) => e,
        }
    }
}

/// A stored identity with metadata.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub name: String,
    pub vector: IdentityVector,
    /// Number of sample images that contributed to the mean.
    pub samples: usize,
    pub created_at: String,
    pub model_version: Option<String>,
}

/// Integer pixel rectangle, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Region {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding::new(vec![3.0, 4.0]).normalized();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.values[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector_unchanged() {
        let e = Embedding::new(vec![0.0, 0.0, 0.0]).normalized();
        assert_eq!(e.values, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_raw_identity_normalizes_once() {
        let raw = IdentityVector::Raw(Embedding::new(vec![2.0, 0.0]));
        assert!(!raw.is_normalized());
        let unit = raw.into_normalized();
        assert_eq!(unit.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_normalized_identity_passes_through() {
        // Deliberately not unit length: a `Normalized` tag is trusted as-is.
        let tagged = IdentityVector::Normalized(Embedding::new(vec![0.5, 0.0]));
        assert_eq!(tagged.into_normalized().values, vec![0.5, 0.0]);
    }

    #[test]
    fn test_region_dimensions() {
        let r = Region { x1: 10, y1: 20, x2: 30, y2: 25 };
        assert_eq!(r.width(), 20);
        assert_eq!(r.height(), 5);
        assert!(r.contains(10, 20));
        assert!(!r.contains(30, 20));
        assert!(!r.is_empty());
        assert!(Region { x1: 5, y1: 5, x2: 5, y2: 9 }.is_empty());
    }

    #[test]
    fn test_bbox_corners() {
        let b = BoundingBox::from_corners(10.0, 20.0, 50.0, 80.0, 0.9);
        assert_eq!(b.width, 40.0);
        assert_eq!(b.corners(), (10.0, 20.0, 50.0, 80.0));
    }
}
