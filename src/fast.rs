// fast.rs — grid FAST-9 corner detector (CPU reference).
//
// The device kernel in shaders/fast.wgsl implements the same algorithm in
// the same three stages, and the host version below is the authority it
// is checked against:
//
//   1. score map   every interior pixel that is a corner at the *lower*
//                  threshold gets its corner score; everything else -1.
//                  Corners rejected by the mask or an exclusion rect keep
//                  their score with `FILTERED` set: they are never
//                  accepted but still suppress weaker neighbours.
//   2. count       per cell, corners accepted at `ini_threshold`.
//   3. collect     per cell, corners accepted at the threshold chosen by
//                  the retry policy.
//
// CELL GRID
// ─────────
// The interior [edge, dim - edge) is split into cells of `cell_size`
// pixels, each reaching `overlap` pixels into its neighbour. FAST needs a
// 3-pixel margin inside each cell, so cell i scans
//
//   [edge + i*cell + 3,  min(edge + i*cell + cell + overlap, dim - edge) - 3)
//
// and with overlap = 6 the scanned ranges tile the interior exactly.
//
// CORNER TEST
// ───────────
// Circle positions come in opposite pairs (k, k + 8). For threshold t:
//   m0 bit k set  ⇔  circle[k] < centre - t   (darker)
//   m1 bit k set  ⇔  circle[k] > centre + t   (brighter)
// Any 9-arc of 16 holds at least one of every opposite pair, so the even
// pairs (0, 2, 4, 6) and then all eight pairs give cheap early exits
// before the final 9-run search on the doubled mask.
//
// SCORE
// ─────
// `corner_score` is the largest t at which the pixel is still a corner,
// i.e. a pixel is a corner at t ⇔ score >= t. One score map therefore
// serves both thresholds and the NMS comparison.

use serde::{Deserialize, Serialize};

use crate::config::{excluded, FastConfig};
use crate::image::Image;

/// Bresenham circle of radius 3, contiguous, opposite points 8 apart.
pub const CIRCLE: [(i32, i32); 16] = [
    (3, 0), (3, -1), (2, -2), (1, -3),
    (0, -3), (-1, -3), (-2, -2), (-3, -1),
    (-3, 0), (-3, 1), (-2, 2), (-1, 3),
    (0, 3), (1, 3), (2, 2), (3, 1),
];

/// Radius of the circle; pixels closer than this to an edge are never tested.
pub const CIRCLE_RADIUS: usize = 3;

/// Minimum contiguous arc length.
pub const ARC_LENGTH: u32 = 9;

/// Score-map flag on corners the level filter rejects.
pub const FILTERED: i32 = 1 << 16;

/// Corner score stored in a score-map entry, or -1 for a non-corner.
#[inline]
pub fn raw_score(entry: i32) -> i32 {
    if entry < 0 {
        entry
    } else {
        entry & (FILTERED - 1)
    }
}

/// When the lower threshold replaces the initial one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry the whole level only if no cell found a corner.
    WholeImage,
    /// Retry each empty cell on its own.
    PerCell,
}

impl RetryPolicy {
    pub fn code(self) -> u32 {
        match self {
            RetryPolicy::WholeImage => 0,
            RetryPolicy::PerCell => 1,
        }
    }
}

/// A detected corner in level coordinates.
///
/// Laid out as a WGSL `vec4<i32>` so device output can be read back
/// directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Corner {
    pub x: i32,
    pub y: i32,
    pub response: i32,
    pad: i32,
}

impl Corner {
    pub fn new(x: i32, y: i32, response: i32) -> Self {
        Corner { x, y, response, pad: 0 }
    }
}

/// Scan bounds of one cell, half-open: `[x0, x1) x [y0, y1)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Cell {
    pub x0: u32,
    pub x1: u32,
    pub y0: u32,
    pub y1: u32,
}

impl Cell {
    #[inline]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 as i32 && x < self.x1 as i32 && y >= self.y0 as i32 && y < self.y1 as i32
    }

    #[inline]
    pub fn area(&self) -> usize {
        ((self.x1 - self.x0) * (self.y1 - self.y0)) as usize
    }
}

/// Cell start/end pairs along one axis.
fn axis_cells(dim: usize, cfg: &FastConfig) -> Vec<(u32, u32)> {
    let edge = cfg.edge_clip;
    if dim <= 2 * edge {
        return Vec::new();
    }
    let (lo, hi) = (edge, dim - edge);
    let n = (hi - lo).div_ceil(cfg.cell_size) + 1;
    (0..n)
        .filter_map(|i| {
            let start = lo + i * cfg.cell_size;
            if hi.saturating_sub(cfg.overlap) <= start {
                return None;
            }
            let end = (start + cfg.cell_size + cfg.overlap).min(hi);
            let (s0, s1) = (start + CIRCLE_RADIUS, end.saturating_sub(CIRCLE_RADIUS));
            (s1 > s0).then_some((s0 as u32, s1 as u32))
        })
        .collect()
}

/// Row-major list of cells covering a `cols x rows` level.
pub fn cell_grid(cols: usize, rows: usize, cfg: &FastConfig) -> Vec<Cell> {
    let xs = axis_cells(cols, cfg);
    let ys = axis_cells(rows, cfg);
    ys.iter()
        .flat_map(|&(y0, y1)| xs.iter().map(move |&(x0, x1)| Cell { x0, x1, y0, y1 }))
        .collect()
}

#[inline]
fn circle_px(img: &Image<u8>, x: usize, y: usize, k: usize) -> i32 {
    let (dx, dy) = CIRCLE[k];
    img.get((x as i32 + dx) as usize, (y as i32 + dy) as usize) as i32
}

/// FAST-9 segment test at threshold `t`.
///
/// `(x, y)` must be at least [`CIRCLE_RADIUS`] pixels from every edge.
pub fn is_corner(img: &Image<u8>, x: usize, y: usize, t: i32) -> bool {
    let v = img.get(x, y) as i32;
    let (t0, t1) = (v - t, v + t);
    // (darker, brighter) bits contributed by the pair (k, k + 8).
    let pair = |k: usize| {
        let a = circle_px(img, x, y, k);
        let b = circle_px(img, x, y, k + 8);
        (
            ((a < t0) as u32) << k | ((b < t0) as u32) << (k + 8),
            ((a > t1) as u32) << k | ((b > t1) as u32) << (k + 8),
        )
    };

    let (mut m0, mut m1) = pair(0);
    if m0 == 0 && m1 == 0 {
        return false;
    }
    for k in [2, 4, 6] {
        let (d, b) = pair(k);
        m0 |= d;
        m1 |= b;
    }
    let even = |m: u32| (m | (m >> 8)) & 0x55 == 0x55;
    if !even(m0) && !even(m1) {
        return false;
    }
    for k in [1, 3, 5, 7] {
        let (d, b) = pair(k);
        m0 |= d;
        m1 |= b;
    }
    let all = |m: u32| (m | (m >> 8)) & 0xff == 0xff;
    if !all(m0) && !all(m1) {
        return false;
    }

    let run = (1u32 << ARC_LENGTH) - 1;
    let (m0, m1) = (m0 | (m0 << 16), m1 | (m1 << 16));
    (0..16).any(|i| (m0 >> i) & run == run || (m1 >> i) & run == run)
}

/// Corner score: the largest threshold at which `(x, y)` stays a corner.
pub fn corner_score(img: &Image<u8>, x: usize, y: usize) -> i32 {
    let v = img.get(x, y) as i32;
    let mut d = [0i32; 25];
    for k in 0..16 {
        d[k] = v - circle_px(img, x, y, k);
    }
    for k in 16..25 {
        d[k] = d[k - 16];
    }

    let mut a0 = 0i32;
    for k in (0..16).step_by(2) {
        let mut a = d[k + 1].min(d[k + 2]).min(d[k + 3]);
        if a <= a0 {
            continue;
        }
        for j in 4..=8 {
            a = a.min(d[k + j]);
        }
        a0 = a0.max(a.min(d[k])).max(a.min(d[k + 9]));
    }

    let mut b0 = -a0;
    for k in (0..16).step_by(2) {
        let mut b = d[k + 1].max(d[k + 2]).max(d[k + 3]);
        if b >= b0 {
            continue;
        }
        for j in 4..=8 {
            b = b.max(d[k + j]);
        }
        b0 = b0.min(b.max(d[k])).min(b.max(d[k + 9]));
    }
    -b0 - 1
}

/// Per-level pixel filter: mask plus exclusion rectangles.
///
/// Rectangles are in full-resolution pixels; a level pixel is tested at
/// `(x * scale, y * scale)`, the same product used when keypoints are
/// rescaled, so a returned keypoint never lands inside a rectangle.
#[derive(Debug, Clone, Default)]
pub struct LevelFilter<'a> {
    pub mask: Option<&'a Image<u8>>,
    pub rects: Vec<[f32; 4]>,
    pub scale: f32,
}

impl LevelFilter<'_> {
    #[inline]
    pub fn allows(&self, x: usize, y: usize) -> bool {
        if let Some(m) = self.mask {
            if m.get(x, y) == 0 {
                return false;
            }
        }
        !excluded(&self.rects, x as f32 * self.scale, y as f32 * self.scale)
    }
}

/// Grid FAST detector with two thresholds.
#[derive(Debug, Clone)]
pub struct GridFast {
    pub config: FastConfig,
    pub ini_threshold: u8,
    pub min_threshold: u8,
}

impl GridFast {
    pub fn new(config: FastConfig, ini_threshold: u8, min_threshold: u8) -> Self {
        GridFast { config, ini_threshold, min_threshold }
    }

    /// Stage 1: scores of pixels that are corners at the lower threshold.
    pub fn score_map(&self, img: &Image<u8>, filter: &LevelFilter<'_>) -> Image<i32> {
        let (w, h) = (img.width(), img.height());
        let mut scores = Image::filled(w, h, -1i32);
        let lo = self.config.edge_clip + CIRCLE_RADIUS;
        if w <= 2 * lo || h <= 2 * lo {
            return scores;
        }
        let t = self.min_threshold as i32;
        for y in lo..h - lo {
            for x in lo..w - lo {
                if is_corner(img, x, y, t) {
                    let flag = if filter.allows(x, y) { 0 } else { FILTERED };
                    scores.set(x, y, corner_score(img, x, y) | flag);
                }
            }
        }
        scores
    }

    /// Whether the pixel survives threshold `t` and, if enabled, NMS.
    /// Neighbours outside the cell's scan region count as weaker; filtered
    /// neighbours compare by their raw score.
    pub fn accept(&self, scores: &Image<i32>, cell: &Cell, x: i32, y: i32, t: i32) -> bool {
        let s = scores.get(x as usize, y as usize);
        if s < t || s & FILTERED != 0 {
            return false;
        }
        if !self.config.nms {
            return true;
        }
        for dy in -1..=1 {
            for dx in -1..=1 {
                if (dx, dy) == (0, 0) || !cell.contains(x + dx, y + dy) {
                    continue;
                }
                if s <= raw_score(scores.get((x + dx) as usize, (y + dy) as usize)) {
                    return false;
                }
            }
        }
        true
    }

    fn count_cell(&self, scores: &Image<i32>, cell: &Cell, t: i32) -> usize {
        let mut n = 0;
        for y in cell.y0 as i32..cell.y1 as i32 {
            for x in cell.x0 as i32..cell.x1 as i32 {
                n += self.accept(scores, cell, x, y, t) as usize;
            }
        }
        n
    }

    /// Stages 2 and 3 over a precomputed score map.
    pub fn collect(&self, scores: &Image<i32>, cells: &[Cell]) -> Vec<Corner> {
        let (ini, min) = (self.ini_threshold as i32, self.min_threshold as i32);
        let counts: Vec<usize> = cells.iter().map(|c| self.count_cell(scores, c, ini)).collect();
        let total: usize = counts.iter().sum();

        let mut out = Vec::new();
        for (cell, &n) in cells.iter().zip(&counts) {
            let t = match self.config.retry {
                RetryPolicy::WholeImage if total > 0 => ini,
                RetryPolicy::PerCell if n > 0 => ini,
                _ => min,
            };
            for y in cell.y0 as i32..cell.y1 as i32 {
                for x in cell.x0 as i32..cell.x1 as i32 {
                    if self.accept(scores, cell, x, y, t) {
                        out.push(Corner::new(x, y, scores.get(x as usize, y as usize)));
                    }
                }
            }
        }
        sort_corners(&mut out);
        out
    }

    /// Detect corners on one level image.
    pub fn detect(&self, img: &Image<u8>, filter: &LevelFilter<'_>) -> Vec<Corner> {
        let cells = cell_grid(img.width(), img.height(), &self.config);
        if cells.is_empty() {
            return Vec::new();
        }
        let scores = self.score_map(img, filter);
        self.collect(&scores, &cells)
    }
}

/// Row-major order; duplicates from overlapping cells are removed.
pub fn sort_corners(corners: &mut Vec<Corner>) {
    corners.sort_by_key(|c| (c.y, c.x));
    corners.dedup_by_key(|c| (c.y, c.x));
}
