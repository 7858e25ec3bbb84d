// pyramid.rs — scale pyramid geometry and the host-side pyramid.
//
// Level i has scale s_i = scale_factor^i and size round(cols / s_i) x
// round(rows / s_i). Each level is a bilinear resize of the *previous*
// level, not of level 0, so rounding compounds the same way on host and
// device.
//
// On the device every camera keeps its levels stacked in one tall
// allocation (the "atlas"), level 0 at the top:
//
//   y = 0        ┌──────────────────────┐
//                │ level 0  (cols x rows)│
//   y = rows     ├──────────────┐───────┘
//                │ level 1      │
//                ├─────────┐────┘
//                │ level 2 │
//                └─────────┘
//
// so one allocation and one stride serve the whole pyramid and each level is
// just a rect view at (0, y_offset).
//
// KEYPOINT BUDGET
// ───────────────
// With f = 1 / scale_factor and L levels, level i asks for
//
//   n_i = round(N (1 - f) / (1 - f^L) · f^i)
//
// and the last level takes whatever remains of N. The series weights the
// budget by level area so every level yields about the same density.

use crate::error::{ExtractorError, Result};
use crate::image::{Image, Rect};
use crate::resize::{apply, Interpolation, ResizePlan, ResizeTarget};

/// Geometry of one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelInfo {
    pub index: usize,
    /// Full-resolution pixels per level pixel.
    pub scale: f32,
    pub cols: usize,
    pub rows: usize,
    /// Keypoints requested from this level.
    pub budget: usize,
    /// First row of this level inside the atlas.
    pub y_offset: usize,
}

impl LevelInfo {
    /// Rect of this level inside the atlas.
    pub fn rect(&self) -> Rect {
        Rect::new(0, self.y_offset, self.cols, self.rows)
    }
}

/// Level geometry for one input size.
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidLayout {
    pub levels: Vec<LevelInfo>,
    /// Atlas width (level 0 width).
    pub atlas_cols: usize,
    /// Sum of all level heights.
    pub atlas_rows: usize,
}

impl PyramidLayout {
    /// # Errors
    /// `InvalidArgument` for an empty image, zero levels or a scale factor
    /// not greater than one.
    pub fn new(
        cols: usize,
        rows: usize,
        scale_factor: f32,
        num_levels: usize,
        max_keypoints: usize,
    ) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(ExtractorError::InvalidArgument(format!(
                "pyramid source must be non-empty (got {cols}x{rows})"
            )));
        }
        if num_levels == 0 {
            return Err(ExtractorError::InvalidArgument("pyramid must have at least 1 level".into()));
        }
        if !(scale_factor.is_finite() && scale_factor > 1.0) {
            return Err(ExtractorError::InvalidArgument(format!(
                "scale factor must be > 1.0 (got {scale_factor})"
            )));
        }
        let budgets = level_budgets(max_keypoints, scale_factor, num_levels);
        let mut levels = Vec::with_capacity(num_levels);
        let mut y_offset = 0;
        for (index, &budget) in budgets.iter().enumerate() {
            let scale = level_scale(scale_factor, index);
            let (lc, lr) = level_size(cols, rows, scale);
            levels.push(LevelInfo { index, scale, cols: lc, rows: lr, budget, y_offset });
            y_offset += lr;
        }
        Ok(PyramidLayout { levels, atlas_cols: cols, atlas_rows: y_offset })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Bilinear plan producing level `i` from level `i - 1` (identity for 0).
    pub fn level_plan(&self, i: usize) -> Result<ResizePlan> {
        let dst = &self.levels[i];
        if i == 0 {
            return ResizePlan::identity(dst.cols, dst.rows);
        }
        let src = &self.levels[i - 1];
        ResizePlan::new(src.cols, src.rows, ResizeTarget::Size(dst.cols, dst.rows), Interpolation::Linear)
    }

    /// Nearest plan sampling the full-resolution mask at `(x * s_i, y * s_i)`.
    pub fn mask_plan(&self, i: usize) -> Result<ResizePlan> {
        let l = &self.levels[i];
        let (c0, r0) = (self.levels[0].cols, self.levels[0].rows);
        ResizePlan::with_inverse_scale(c0, r0, l.cols, l.rows, l.scale, l.scale, Interpolation::Nearest)
    }
}

/// `scale_factor^i`, evaluated in double precision.
pub fn level_scale(scale_factor: f32, i: usize) -> f32 {
    (scale_factor as f64).powi(i as i32) as f32
}

/// Level dimensions, at least one pixel each.
pub fn level_size(cols: usize, rows: usize, scale: f32) -> (usize, usize) {
    let c = (cols as f32 / scale).round() as usize;
    let r = (rows as f32 / scale).round() as usize;
    (c.max(1), r.max(1))
}

/// Per-level keypoint budgets summing to `total`.
pub fn level_budgets(total: usize, scale_factor: f32, num_levels: usize) -> Vec<usize> {
    if num_levels == 0 {
        return Vec::new();
    }
    let f = 1.0 / scale_factor as f64;
    let mut desired = total as f64 * (1.0 - f) / (1.0 - f.powi(num_levels as i32));
    let mut budgets = Vec::with_capacity(num_levels);
    let mut sum = 0usize;
    for _ in 0..num_levels - 1 {
        let n = (desired.round() as usize).min(total - sum);
        budgets.push(n);
        sum += n;
        desired *= f;
    }
    budgets.push(total - sum);
    budgets
}

/// Host-side pyramid of 8-bit levels.
pub struct Pyramid {
    /// Levels from finest (index 0) to coarsest.
    pub levels: Vec<Image<u8>>,
}

impl Pyramid {
    /// Build all levels of `layout` from `src`.
    ///
    /// # Errors
    /// `SizeMismatch` if `src` does not match level 0 of the layout.
    pub fn build(src: &Image<u8>, layout: &PyramidLayout) -> Result<Self> {
        let l0 = &layout.levels[0];
        if (src.width(), src.height()) != (l0.cols, l0.rows) {
            return Err(ExtractorError::SizeMismatch(format!(
                "pyramid expects {}x{}, image is {}x{}",
                l0.cols,
                l0.rows,
                src.width(),
                src.height()
            )));
        }
        let mut levels: Vec<Image<u8>> = Vec::with_capacity(layout.num_levels());
        levels.push(src.clone());
        for i in 1..layout.num_levels() {
            let plan = layout.level_plan(i)?;
            let next = apply(&levels[i - 1], &plan)?;
            levels.push(next);
        }
        Ok(Pyramid { levels })
    }

    /// Per-level masks sampled from a full-resolution mask.
    pub fn build_masks(mask: &Image<u8>, layout: &PyramidLayout) -> Result<Vec<Image<u8>>> {
        (0..layout.num_levels())
            .map(|i| apply(mask, &layout.mask_plan(i)?))
            .collect()
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &Image<u8> {
        &self.levels[level]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_dimensions() {
        let layout = PyramidLayout::new(640, 480, 1.2, 8, 2000).unwrap();
        let sizes: Vec<(usize, usize)> = layout.levels.iter().map(|l| (l.cols, l.rows)).collect();
        assert_eq!(
            sizes,
            vec![(640, 480), (533, 400), (444, 333), (370, 278), (309, 231), (257, 193), (214, 161), (179, 134)]
        );
        assert_eq!(layout.atlas_rows, sizes.iter().map(|s| s.1).sum::<usize>());
        assert_eq!(layout.levels[3].y_offset, 480 + 400 + 333);
    }

    #[test]
    fn test_budgets_sum_to_total() {
        for (n, f, l) in [(2000, 1.2f32, 8), (1000, 2.0, 3), (7, 1.2, 8), (0, 1.2, 4), (500, 1.5, 1)] {
            let b = level_budgets(n, f, l);
            assert_eq!(b.len(), l);
            assert_eq!(b.iter().sum::<usize>(), n, "{n} over {l} levels: {b:?}");
        }
        // Finer levels get more.
        let b = level_budgets(2000, 1.2, 8);
        assert_eq!(b[0], 434);
        assert!(b.windows(2).take(6).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(PyramidLayout::new(0, 10, 1.2, 3, 10).is_err());
        assert!(PyramidLayout::new(10, 10, 1.0, 3, 10).is_err());
        assert!(PyramidLayout::new(10, 10, 1.2, 0, 10).is_err());
    }

    #[test]
    fn test_tiny_levels_clamp_to_one_pixel() {
        let layout = PyramidLayout::new(3, 2, 2.0, 4, 10).unwrap();
        assert!(layout.levels.iter().all(|l| l.cols >= 1 && l.rows >= 1));
    }

    #[test]
    fn test_constant_image_stays_constant() {
        let img = Image::filled(97, 61, 200u8);
        let layout = PyramidLayout::new(97, 61, 1.2, 6, 100).unwrap();
        let pyr = Pyramid::build(&img, &layout).unwrap();
        assert_eq!(pyr.num_levels(), 6);
        for (i, level) in pyr.levels.iter().enumerate() {
            assert_eq!((level.width(), level.height()), (layout.levels[i].cols, layout.levels[i].rows));
            assert!(level.pixels().all(|(_, _, v)| v == 200), "level {i}");
        }
    }

    #[test]
    fn test_size_mismatch() {
        let layout = PyramidLayout::new(64, 64, 1.2, 2, 10).unwrap();
        let err = Pyramid::build(&Image::new(32, 64), &layout);
        assert!(matches!(err, Err(ExtractorError::SizeMismatch(_))));
    }

    #[test]
    fn test_mask_levels_sample_full_resolution() {
        // Left half masked out; level pixels map back to x * scale.
        let mut mask = Image::filled(120, 40, 255u8);
        for y in 0..40 {
            for x in 0..60 {
                mask.set(x, y, 0);
            }
        }
        let layout = PyramidLayout::new(120, 40, 1.5, 3, 10).unwrap();
        let masks = Pyramid::build_masks(&mask, &layout).unwrap();
        for (i, m) in masks.iter().enumerate() {
            let s = layout.levels[i].scale;
            for (x, y, v) in m.pixels() {
                let fx = ((x as f32 * s).floor() as usize).min(119);
                let fy = ((y as f32 * s).floor() as usize).min(39);
                assert_eq!(v, mask.get(fx, fy), "level {i} at ({x},{y})");
            }
        }
    }
}
