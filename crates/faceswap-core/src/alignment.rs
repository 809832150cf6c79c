//! Five-point face alignment.
//!
//! Faces are mapped onto canonical square crops with a similarity transform
//! (uniform scale, rotation, translation) fitted to the InsightFace landmark
//! template. The recognizer uses 112×112 crops and the swapper 128×128.

use image::{Rgb, RgbImage};

/// ArcFace landmark template for a 112×112 crop.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Landmark template for a square crop of `size` pixels.
///
/// Multiples of 112 scale the template; other sizes follow the 128 convention
/// (scale by `size / 128`, shift right by `8 * size / 128`).
pub fn reference_landmarks(size: usize) -> [(f32, f32); 5] {
    let (ratio, shift) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let ratio = size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };
    TEMPLATE_112.map(|(x, y)| (x * ratio + shift, y * ratio))
}

/// `p ↦ [[a, −b], [b, a]]·p + (tx, ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Similarity = Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit mapping `src` onto `dst`.
    ///
    /// Coincident source points carry no scale information; the identity is
    /// returned for them.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Similarity {
        let n = src.len().min(dst.len());
        if n == 0 {
            return Self::IDENTITY;
        }
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n].iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let (mut spread, mut along, mut across) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst).take(n) {
            let (sx, sy, dx, dy) = (sx - smx, sy - smy, dx - dmx, dy - dmy);
            spread += sx * sx + sy * sy;
            along += sx * dx + sy * dy;
            across += sx * dy - sy * dx;
        }
        if spread < 1e-12 {
            return Self::IDENTITY;
        }

        let (a, b) = (along / spread, across / spread);
        Similarity {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// The reverse mapping, or `None` when the scale is zero.
    pub fn inverse(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Similarity {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear RGB sample at a sub-pixel position. Out-of-bounds taps read as black.
pub fn sample_bilinear(image: &RgbImage, sx: f32, sy: f32) -> [f32; 3] {
    let (x0, y0) = (sx.floor(), sy.floor());
    let (fx, fy) = (sx - x0, sy - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let tap = |x: i64, y: i64| -> [f32; 3] {
        if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
            return [0.0; 3];
        }
        image.get_pixel(x as u32, y as u32).0.map(f32::from)
    };
    let weights = [
        ((x0, y0), (1.0 - fx) * (1.0 - fy)),
        ((x0 + 1, y0), fx * (1.0 - fy)),
        ((x0, y0 + 1), (1.0 - fx) * fy),
        ((x0 + 1, y0 + 1), fx * fy),
    ];

    let mut acc = [0.0f32; 3];
    for ((x, y), w) in weights {
        if w == 0.0 {
            continue;
        }
        let p = tap(x, y);
        for c in 0..3 {
            acc[c] += p[c] * w;
        }
    }
    acc
}

/// Align a face to a canonical `size`×`size` crop.
///
/// Returns the crop and the frame → crop transform; callers invert it to
/// paste results back into the frame.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: usize) -> (RgbImage, Similarity) {
    let to_crop = Similarity::estimate(landmarks, &reference_landmarks(size));
    let side = size as u32;
    let crop = match to_crop.inverse() {
        Some(to_frame) => RgbImage::from_fn(side, side, |x, y| {
            let (sx, sy) = to_frame.apply(x as f32, y as f32);
            Rgb(sample_bilinear(image, sx, sy).map(|v| v.round().clamp(0.0, 255.0) as u8))
        }),
        None => RgbImage::new(side, side),
    };
    (crop, to_crop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_estimate_identity() {
        let t = Similarity::estimate(&TEMPLATE_112, &TEMPLATE_112);
        assert!((t.a - 1.0).abs() < 1e-5);
        assert!(t.b.abs() < 1e-5);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_estimate_recovers_exact_similarity() {
        // 30° rotation, scale 1.5, translation (20, -7).
        let truth = Similarity {
            a: 1.5 * 30f32.to_radians().cos(),
            b: 1.5 * 30f32.to_radians().sin(),
            tx: 20.0,
            ty: -7.0,
        };
        let dst = TEMPLATE_112.map(|(x, y)| truth.apply(x, y));
        let fit = Similarity::estimate(&TEMPLATE_112, &dst);
        assert!((fit.a - truth.a).abs() < 1e-4);
        assert!((fit.b - truth.b).abs() < 1e-4);
        assert!((fit.tx - truth.tx).abs() < 1e-2);
        assert!((fit.ty - truth.ty).abs() < 1e-2);
    }

    #[test]
    fn test_estimate_degenerate_is_identity() {
        let same = [(5.0, 5.0); 5];
        assert_eq!(Similarity::estimate(&same, &TEMPLATE_112), Similarity::IDENTITY);
    }

    #[test]
    fn test_reference_landmarks_128_shift() {
        let r112 = reference_landmarks(112);
        let r128 = reference_landmarks(128);
        assert_eq!(r112, TEMPLATE_112);
        for (a, b) in r112.iter().zip(&r128) {
            assert!(close((a.0 + 8.0, a.1), *b, 1e-4));
        }
        let r256 = reference_landmarks(256);
        assert!(close(r256[0], (TEMPLATE_112[0].0 * 2.0 + 16.0, TEMPLATE_112[0].1 * 2.0), 1e-3));
    }

    #[test]
    fn test_inverse_roundtrip() {
        let src = TEMPLATE_112.map(|(x, y)| (x * 1.7 + 40.0, y * 1.7 + 12.0));
        let t = Similarity::estimate(&src, &reference_landmarks(128));
        let inv = t.inverse().unwrap();
        let (cx, cy) = t.apply(90.0, 75.0);
        assert!(close(inv.apply(cx, cy), (90.0, 75.0), 1e-2));
        assert!(Similarity { a: 0.0, b: 0.0, tx: 3.0, ty: 4.0 }.inverse().is_none());
    }

    #[test]
    fn test_sample_bilinear() {
        let image = RgbImage::from_fn(2, 1, |x, _| Rgb([x as u8 * 100, 0, 0]));
        assert_eq!(sample_bilinear(&image, 0.0, 0.0), [0.0, 0.0, 0.0]);
        assert!((sample_bilinear(&image, 0.5, 0.0)[0] - 50.0).abs() < 1e-4);
        // Half of the right tap falls outside the frame.
        assert!((sample_bilinear(&image, 1.5, 0.0)[0] - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_align_face_uniform_frame() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 64, 32]));
        let (aligned, t) = align_face(&image, &TEMPLATE_112, 112);
        assert_eq!(aligned.dimensions(), (112, 112));
        assert_eq!(aligned.get_pixel(56, 56).0, [128, 64, 32]);
        assert!((t.a - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_align_face_moves_eye_to_template() {
        let mut image = RgbImage::new(200, 200);
        let landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for dy in 0..5 {
            for dx in 0..5 {
                image.put_pixel(78 + dx, 58 + dy, Rgb([255, 255, 255]));
            }
        }

        let (aligned, _) = align_face(&image, &landmarks, 112);

        let (ex, ey) = (TEMPLATE_112[0].0.round() as u32, TEMPLATE_112[0].1.round() as u32);
        let brightest = (ey - 1..=ey + 1)
            .flat_map(|y| (ex - 1..=ex + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "left eye patch not near ({ex}, {ey}): {brightest}");
    }
}
