//! Affine (rotation + scale) sample table builder
//!
//! Tables are built by inverse mapping: every destination pixel is mapped
//! back to a source coordinate, which is then sampled with nearest-neighbor
//! or bilinear interpolation. The resulting entries are baked into a
//! [`SampleTable`] so the per-frame work is only the weighted sum.

use nalgebra::{Rotation2, Vector2};
use rayon::prelude::*;

use crate::config::{Interpolation, TransformConfig};
use crate::error::{Result, WarpError};
use crate::table::{SampleEntry, SampleTable};

/// Slack allowed past the image border before a coordinate is out of bounds.
/// Absorbs rounding noise from sin/cos at multiples of 90 degrees.
const EDGE_EPSILON: f64 = 1e-9;

/// Rotation by `angle` and independent X/Y scaling about a center point
#[derive(Debug, Clone)]
pub struct AffineTransform {
    rotation: Rotation2<f64>,
    /// Rotation by `-angle`, used for reverse mapping
    inverse: Rotation2<f64>,
    scale: Vector2<f64>,
    center: Vector2<f64>,
}

impl AffineTransform {
    pub fn from_config(config: &TransformConfig) -> Self {
        let (sx, sy) = config.effective_scale();
        Self {
            rotation: Rotation2::new(config.angle),
            inverse: Rotation2::new(-config.angle),
            scale: Vector2::new(sx, sy),
            center: Vector2::new(config.center_x as f64, config.center_y as f64),
        }
    }

    /// Transform a point from source to destination coordinates
    #[inline]
    pub fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        let offset = (Vector2::new(x, y) - self.center).component_mul(&self.scale);
        let p = self.rotation * offset + self.center;
        (p.x, p.y)
    }

    /// Transform a point from destination to source coordinates (inverse)
    #[inline]
    pub fn inverse_transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        let offset = self.inverse * (Vector2::new(x, y) - self.center);
        let p = offset.component_div(&self.scale) + self.center;
        (p.x, p.y)
    }
}

/// Build a table warping an `input_width x input_height` image onto itself
pub fn build_from_affine(
    config: &TransformConfig,
    input_width: usize,
    input_height: usize,
) -> Result<SampleTable> {
    if input_width == 0 || input_height == 0 {
        return Err(WarpError::Configuration(format!(
            "input must be non-empty, got {}x{}",
            input_width, input_height
        )));
    }
    config.validate()?;

    let transform = AffineTransform::from_config(config);
    let spp = config.interpolation.samples_per_pixel();
    let row_len = input_width * spp;
    let mut entries = vec![SampleEntry::invalid(); row_len * input_height];

    entries
        .par_chunks_mut(row_len)
        .enumerate()
        .try_for_each(|(dst_y, row)| {
            for (dst_x, px) in row.chunks_mut(spp).enumerate() {
                let (src_x, src_y) =
                    transform.inverse_transform_point(dst_x as f64, dst_y as f64);
                if !src_x.is_finite() || !src_y.is_finite() {
                    return Err(WarpError::Configuration(format!(
                        "pixel ({}, {}) maps to non-finite source ({}, {})",
                        dst_x, dst_y, src_x, src_y
                    )));
                }

                match config.interpolation {
                    Interpolation::Nearest => {
                        px[0] = nearest_entry(input_width, input_height, src_x, src_y);
                    }
                    Interpolation::Bilinear => {
                        bilinear_entries(px, input_width, input_height, src_x, src_y);
                    }
                }
            }
            Ok(())
        })?;

    let table = SampleTable::new(
        (input_width, input_height),
        (input_width, input_height),
        spp,
        entries,
    )?;

    tracing::debug!(
        "Built {} table {}x{} (angle={:.4} rad, scale={:?}, {} invalid pixels)",
        config.interpolation.as_str(),
        input_width,
        input_height,
        config.angle,
        config.effective_scale(),
        table.invalid_pixels()
    );

    Ok(table)
}

/// Nearest-neighbor entry for a source coordinate
#[inline]
fn nearest_entry(width: usize, height: usize, x: f64, y: f64) -> SampleEntry {
    let xi = x.round();
    let yi = y.round();

    if xi < 0.0 || yi < 0.0 || xi >= width as f64 || yi >= height as f64 {
        return SampleEntry::invalid();
    }

    SampleEntry::new(yi as usize * width + xi as usize, 1.0)
}

/// Fill the four bilinear entries for a source coordinate.
///
/// If any neighbor falls outside the image the whole set stays invalid.
#[inline]
fn bilinear_entries(px: &mut [SampleEntry], width: usize, height: usize, x: f64, y: f64) {
    let (Some((x0, x1, fx)), Some((y0, y1, fy))) = (bracket(x, width), bracket(y, height)) else {
        px.fill(SampleEntry::invalid());
        return;
    };

    px[0] = SampleEntry::new(y0 * width + x0, (1.0 - fx) * (1.0 - fy));
    px[1] = SampleEntry::new(y0 * width + x1, fx * (1.0 - fy));
    px[2] = SampleEntry::new(y1 * width + x0, (1.0 - fx) * fy);
    px[3] = SampleEntry::new(y1 * width + x1, fx * fy);
}

/// Integer neighbors `(lo, hi)` bracketing `coord` and the fraction past `lo`.
///
/// A coordinate on the last pixel is bracketed from below, so `hi` never
/// leaves the axis for an in-bounds coordinate.
#[inline]
fn bracket(coord: f64, len: usize) -> Option<(usize, usize, f64)> {
    let last = (len - 1) as f64;
    if coord < -EDGE_EPSILON || coord > last + EDGE_EPSILON {
        return None;
    }
    let coord = coord.clamp(0.0, last);

    let lo = (coord.floor() as usize).min(len.saturating_sub(2));
    let hi = (lo + 1).min(len - 1);
    Some((lo, hi, coord - lo as f64))
}
