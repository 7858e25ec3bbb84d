// resize.rs — nearest / bilinear resize of 8-bit images.
//
// FIXED-POINT BILINEAR
// ────────────────────
// Each destination column dx maps to a source coordinate
//
//   fx = (dx + 0.5) * inv_fx - 0.5,   x0 = floor(fx),   u = fx - x0
//
// clamped to the image (u = 0 when clamped), with x1 = min(x0 + 1, cols - 1).
// The weights are quantized to 11 bits:
//
//   U = rint(u * 2048),   U1 = rint(2048 - u * 2048)
//
// and a pixel is the 22-bit product sum rounded back to 8 bits:
//
//   out = (U1·V1·p00 + U·V1·p01 + U1·V·p10 + U·V·p11 + 2^21) >> 22
//
// Nearest uses the same formula with taps (x0 = x1 = floor(dx * inv_fx),
// U1 = 2048, U = 0), so it reproduces the source pixel exactly.
//
// TABLES, NOT PER-PIXEL FLOATS
// ────────────────────────────
// All floating-point work happens once per column and once per row, on the
// host, in `ResizePlan`. The device kernel (shaders/resize.wgsl) receives
// the same tables and does integer arithmetic only, so its output is
// bit-identical to `apply()` regardless of how the GPU rounds floats.

use serde::{Deserialize, Serialize};

use crate::error::{ExtractorError, Result};
use crate::image::Image;

/// Fractional bits of the interpolation weights.
pub const INTER_RESIZE_COEF_BITS: u32 = 11;
const COEF_SCALE: f32 = (1 << INTER_RESIZE_COEF_BITS) as f32;
/// Bits dropped when the two weight products are folded back to 8 bits.
pub const CAST_BITS: u32 = 2 * INTER_RESIZE_COEF_BITS;

/// Interpolation mode. Only these two are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    Linear,
}

/// Requested output geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResizeTarget {
    /// Explicit output size `(cols, rows)`.
    Size(usize, usize),
    /// Independent scale factors; output size is `round(src * f)`.
    Scale(f64, f64),
}

/// One output coordinate's source taps and weights.
///
/// `w0` weights `i0`, `w1` weights `i1`; `w0 + w1` is 2048 up to rounding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AxisTap {
    pub i0: u32,
    pub i1: u32,
    pub w0: u32,
    pub w1: u32,
}

/// Per-axis tap tables for one resize.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizePlan {
    pub src_cols: usize,
    pub src_rows: usize,
    pub dst_cols: usize,
    pub dst_rows: usize,
    pub x: Vec<AxisTap>,
    pub y: Vec<AxisTap>,
}

impl ResizePlan {
    /// Build the tables for resizing `src_cols x src_rows` to `target`.
    ///
    /// # Errors
    /// `InvalidArgument` if any source or destination dimension is zero or
    /// a scale factor is not a positive finite number.
    pub fn new(
        src_cols: usize,
        src_rows: usize,
        target: ResizeTarget,
        mode: Interpolation,
    ) -> Result<Self> {
        let (dst_cols, dst_rows, inv_fx, inv_fy) = match target {
            ResizeTarget::Size(c, r) => {
                (c, r, src_cols as f32 / c as f32, src_rows as f32 / r as f32)
            }
            ResizeTarget::Scale(fx, fy) => {
                if !(fx.is_finite() && fx > 0.0 && fy.is_finite() && fy > 0.0) {
                    return Err(ExtractorError::InvalidArgument(format!(
                        "resize factors must be positive (got fx={fx}, fy={fy})"
                    )));
                }
                (
                    (src_cols as f64 * fx).round() as usize,
                    (src_rows as f64 * fy).round() as usize,
                    (1.0 / fx) as f32,
                    (1.0 / fy) as f32,
                )
            }
        };
        Self::with_inverse_scale(src_cols, src_rows, dst_cols, dst_rows, inv_fx, inv_fy, mode)
    }

    /// Build the tables from explicit inverse scales (source pixels per
    /// destination pixel). The pyramid uses this so mask sampling and
    /// keypoint rescaling share the exact same `f32` factor.
    pub fn with_inverse_scale(
        src_cols: usize,
        src_rows: usize,
        dst_cols: usize,
        dst_rows: usize,
        inv_fx: f32,
        inv_fy: f32,
        mode: Interpolation,
    ) -> Result<Self> {
        if src_cols == 0 || src_rows == 0 || dst_cols == 0 || dst_rows == 0 {
            return Err(ExtractorError::InvalidArgument(format!(
                "resize {src_cols}x{src_rows} -> {dst_cols}x{dst_rows}: dimensions must be non-zero"
            )));
        }
        Ok(ResizePlan {
            src_cols,
            src_rows,
            dst_cols,
            dst_rows,
            x: axis_taps(dst_cols, src_cols, inv_fx, mode),
            y: axis_taps(dst_rows, src_rows, inv_fy, mode),
        })
    }

    /// Identity plan (a plain copy).
    pub fn identity(cols: usize, rows: usize) -> Result<Self> {
        Self::with_inverse_scale(cols, rows, cols, rows, 1.0, 1.0, Interpolation::Nearest)
    }
}

/// Compute the taps for `dst_len` output samples along one axis.
pub fn axis_taps(dst_len: usize, src_len: usize, inv_scale: f32, mode: Interpolation) -> Vec<AxisTap> {
    let last = src_len as i64 - 1;
    (0..dst_len)
        .map(|d| match mode {
            Interpolation::Nearest => {
                let s = ((d as f32 * inv_scale).floor() as i64).clamp(0, last) as u32;
                AxisTap { i0: s, i1: s, w0: 1 << INTER_RESIZE_COEF_BITS, w1: 0 }
            }
            Interpolation::Linear => {
                let f = (d as f32 + 0.5) * inv_scale - 0.5;
                let mut s = f.floor() as i64;
                let mut u = f - s as f32;
                if s < 0 {
                    s = 0;
                    u = 0.0;
                }
                if s > last {
                    s = last;
                    u = 0.0;
                }
                let s1 = (s + 1).min(last);
                let u = u * COEF_SCALE;
                AxisTap {
                    i0: s as u32,
                    i1: s1 as u32,
                    w0: (COEF_SCALE - u).round_ties_even() as u32,
                    w1: u.round_ties_even() as u32,
                }
            }
        })
        .collect()
}

/// Blend four source pixels with fixed-point weights.
#[inline]
pub fn blend(tx: &AxisTap, ty: &AxisTap, p00: u8, p01: u8, p10: u8, p11: u8) -> u8 {
    let val = tx.w0 * ty.w0 * p00 as u32
        + tx.w1 * ty.w0 * p01 as u32
        + tx.w0 * ty.w1 * p10 as u32
        + tx.w1 * ty.w1 * p11 as u32;
    ((val + (1 << (CAST_BITS - 1))) >> CAST_BITS).min(255) as u8
}

/// Execute a plan on the host.
///
/// # Errors
/// `SizeMismatch` if `src` does not have the plan's source dimensions.
pub fn apply(src: &Image<u8>, plan: &ResizePlan) -> Result<Image<u8>> {
    if src.width() != plan.src_cols || src.height() != plan.src_rows {
        return Err(ExtractorError::SizeMismatch(format!(
            "plan expects {}x{}, image is {}x{}",
            plan.src_cols,
            plan.src_rows,
            src.width(),
            src.height(),
        )));
    }
    let mut dst = Image::new(plan.dst_cols, plan.dst_rows);
    for (dy, ty) in plan.y.iter().enumerate() {
        let r0 = src.row(ty.i0 as usize);
        let r1 = src.row(ty.i1 as usize);
        let out = dst.row_mut(dy);
        for (o, tx) in out.iter_mut().zip(plan.x.iter()) {
            let (a, b) = (tx.i0 as usize, tx.i1 as usize);
            *o = blend(tx, ty, r0[a], r0[b], r1[a], r1[b]);
        }
    }
    Ok(dst)
}

/// Resize an 8-bit image (CPU reference).
pub fn resize(src: &Image<u8>, target: ResizeTarget, mode: Interpolation) -> Result<Image<u8>> {
    let plan = ResizePlan::new(src.width(), src.height(), target, mode)?;
    apply(src, &plan)
}
