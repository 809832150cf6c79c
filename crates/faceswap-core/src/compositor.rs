//! Region compositor: swap, restore, colour-match and feather one face.
//!
//! The restoration patch is the detected face box enlarged around its centre,
//! so the restorer sees context and the feathered blend has a margin. Only
//! pixels inside that enlarged box are ever written back.

use crate::restorer::{FaceRestorer, RestorerError};
use crate::swapper::{FaceSwapper, SwapperError};
use crate::types::{BoundingBox, Embedding, Region};
use image::imageops;
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_filled_ellipse_mut;
use imageproc::filter::separable_filter_equal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ENLARGE_SCALE: f32 = 1.6;
pub const DEFAULT_FEATHER: u32 = 30;

#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("swap failed: {0}")]
    Swap(#[from] SwapperError),
    #[error("restoration failed: {0}")]
    Restore(#[from] RestorerError),
    #[error("swapper returned a {actual:?} frame for a {expected:?} input")]
    FrameSize { expected: (u32, u32), actual: (u32, u32) },
}

/// Blended pixels for one face and where they belong in the frame.
#[derive(Debug, Clone)]
pub struct CompositedPatch {
    pub region: Region,
    pub pixels: RgbImage,
}

impl CompositedPatch {
    /// Copy the patch into `image` at its region.
    pub fn write_into(&self, image: &mut RgbImage) {
        for (x, y, pixel) in self.pixels.enumerate_pixels() {
            image.put_pixel(self.region.x1 + x, self.region.y1 + y, *pixel);
        }
    }
}

/// Compositing parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Compositor {
    /// Width/height multiplier applied to the detected box around its centre.
    pub enlarge_scale: f32,
    /// Inset of the blend ellipse from the patch border, and blur radius, in pixels.
    pub feather: u32,
}

impl Default for Compositor {
    fn default() -> Self {
        Self {
            enlarge_scale: DEFAULT_ENLARGE_SCALE,
            feather: DEFAULT_FEATHER,
        }
    }
}

impl Compositor {
    /// Swap one face and write the blended patch back into `image`.
    ///
    /// Returns the region that was written, or `None` when the face box is
    /// degenerate and nothing changed.
    pub fn composite(
        &self,
        image: &mut RgbImage,
        face: &BoundingBox,
        source: &Embedding,
        swapper: &dyn FaceSwapper,
        restorer: Option<&dyn FaceRestorer>,
    ) -> Result<Option<Region>, CompositeError> {
        let patch = self.render_patch(image, face, source, swapper, restorer)?;
        Ok(patch.map(|p| {
            p.write_into(image);
            p.region
        }))
    }

    /// Produce the blended patch for one face without touching `frame`.
    pub fn render_patch(
        &self,
        frame: &RgbImage,
        face: &BoundingBox,
        source: &Embedding,
        swapper: &dyn FaceSwapper,
        restorer: Option<&dyn FaceRestorer>,
    ) -> Result<Option<CompositedPatch>, CompositeError> {
        let (width, height) = frame.dimensions();
        let region = enlarge_box(face, width, height, self.enlarge_scale);
        if region.is_empty() {
            tracing::warn!(?region, "enlarged face region is empty; skipping face");
            return Ok(None);
        }

        let swapped = swapper.swap(frame, face, source)?;
        if swapped.dimensions() != (width, height) {
            return Err(CompositeError::FrameSize {
                expected: (width, height),
                actual: swapped.dimensions(),
            });
        }

        let face_region = crop(&swapped, region);

        let Some(restorer) = restorer else {
            return Ok(Some(CompositedPatch { region, pixels: face_region }));
        };

        let restored = restorer.restore(&face_region)?;
        let matched = match_histograms(&restored, &face_region);
        let mask = feather_mask(region.height(), region.width(), self.feather);
        let pixels = blend(&matched, &face_region, &mask);

        tracing::debug!(
            x1 = region.x1,
            y1 = region.y1,
            x2 = region.x2,
            y2 = region.y2,
            "face composited"
        );
        Ok(Some(CompositedPatch { region, pixels }))
    }
}

fn crop(image: &RgbImage, region: Region) -> RgbImage {
    imageops::crop_imm(image, region.x1, region.y1, region.width(), region.height()).to_image()
}

/// Enlarge a face box around its centre by `scale`, clipped to the image.
///
/// Box corners are truncated to whole pixels first; the enlarged size is
/// capped at the image size before clipping.
pub fn enlarge_box(face: &BoundingBox, image_width: u32, image_height: u32, scale: f32) -> Region {
    let (x1, y1, x2, y2) = face.corners();
    let (x1, y1, x2, y2) = (x1.trunc(), y1.trunc(), x2.trunc(), y2.trunc());
    let (img_w, img_h) = (image_width as f32, image_height as f32);

    let w = x2 - x1;
    let h = y2 - y1;
    let cx = x1 + w / 2.0;
    let cy = y1 + h / 2.0;
    let new_w = img_w.min(w * scale);
    let new_h = img_h.min(h * scale);

    let clip = |v: f32, max: f32| v.clamp(0.0, max) as u32;
    let region = Region {
        x1: clip(cx - new_w / 2.0, img_w),
        y1: clip(cy - new_h / 2.0, img_h),
        x2: clip(cx + new_w / 2.0, img_w),
        y2: clip(cy + new_h / 2.0, img_h),
    };
    if region.x2 < region.x1 || region.y2 < region.y1 {
        return Region { x1: region.x1, y1: region.y1, x2: region.x1, y2: region.y1 };
    }
    region
}

/// Channel-wise histogram matching of `source` onto `reference`.
///
/// Each source level maps to the reference level at the same cumulative
/// quantile, interpolating linearly between the reference's occupied levels.
pub fn match_histograms(source: &RgbImage, reference: &RgbImage) -> RgbImage {
    let src_total = source.pixels().len() as f64;
    let ref_total = reference.pixels().len() as f64;
    if src_total == 0.0 || ref_total == 0.0 {
        return source.clone();
    }

    let mut lookup = [[0u8; 256]; 3];
    for (c, table) in lookup.iter_mut().enumerate() {
        let mut src_counts = [0u64; 256];
        let mut ref_counts = [0u64; 256];
        for p in source.pixels() {
            src_counts[p.0[c] as usize] += 1;
        }
        for p in reference.pixels() {
            ref_counts[p.0[c] as usize] += 1;
        }

        // Occupied reference levels and their cumulative quantiles.
        let mut ref_values = Vec::new();
        let mut ref_quantiles = Vec::new();
        let mut cumulative = 0u64;
        for (level, &count) in ref_counts.iter().enumerate() {
            if count > 0 {
                cumulative += count;
                ref_values.push(level as f64);
                ref_quantiles.push(cumulative as f64 / ref_total);
            }
        }

        let mut cumulative = 0u64;
        for (level, &count) in src_counts.iter().enumerate() {
            cumulative += count;
            let quantile = cumulative as f64 / src_total;
            let value = interp(quantile, &ref_quantiles, &ref_values);
            table[level] = value.clamp(0.0, 255.0) as u8;
        }
    }

    RgbImage::from_fn(source.width(), source.height(), |x, y| {
        let p = source.get_pixel(x, y).0;
        Rgb([lookup[0][p[0] as usize], lookup[1][p[1] as usize], lookup[2][p[2] as usize]])
    })
}

/// Piecewise-linear interpolation over increasing `xp`, clamped at both ends.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let (Some(&first), Some(&last)) = (xp.first(), xp.last()) else {
        return 0.0;
    };
    if x <= first {
        return fp[0];
    }
    if x >= last {
        return fp[fp.len() - 1];
    }
    let i = xp.partition_point(|&v| v <= x);
    let (x0, x1) = (xp[i - 1], xp[i]);
    let (y0, y1) = (fp[i - 1], fp[i]);
    if x1 == x0 {
        return y0;
    }
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// Elliptical feather mask of `height`×`width`, row-major, values in [0, 1].
///
/// A filled ellipse inscribed in the patch and inset by `feather` pixels is
/// blurred with a `(2·feather+1)`-tap Gaussian, giving 1 in the centre and a
/// smooth fall to 0 at the border.
pub fn feather_mask(height: u32, width: u32, feather: u32) -> Vec<f32> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let radius = |extent: u32| (extent / 2).saturating_sub(feather).max(1) as i32;

    let mut ellipse: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::new(width, height);
    draw_filled_ellipse_mut(
        &mut ellipse,
        ((width / 2) as i32, (height / 2) as i32),
        radius(width),
        radius(height),
        Luma([1.0]),
    );

    let kernel = gaussian_kernel(2 * feather as usize + 1);
    separable_filter_equal(&ellipse, &kernel).into_raw()
}

/// Gaussian kernel with the sigma OpenCV derives from the kernel size.
fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (ksize / 2) as f32;
    let mut kernel: Vec<f32> = (0..ksize)
        .map(|i| {
            let d = i as f32 - half;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// `front·mask + back·(1 − mask)` per pixel and channel, clipped and truncated to u8.
pub fn blend(front: &RgbImage, back: &RgbImage, mask: &[f32]) -> RgbImage {
    let width = front.width();
    RgbImage::from_fn(width, front.height(), |x, y| {
        let m = mask[(y * width + x) as usize];
        let f = front.get_pixel(x, y).0;
        let b = back.get_pixel(x, y).0;
        Rgb(std::array::from_fn(|c| {
            (f[c] as f32 * m + b[c] as f32 * (1.0 - m)).clamp(0.0, 255.0) as u8
        }))
    })
}
