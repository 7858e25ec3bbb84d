// gpu/fast.rs — grid FAST-9 on the device.
//
// OUTPUT STRATEGY: score map + per-level append list
// ───────────────────────────────────────────────────
// Per level, three dispatches from shaders/fast.wgsl share one scratch set:
//
//   score    dense i32 score map (own slot per pixel, no contention)
//   count    per-cell corner count at the initial threshold; the level
//            total accumulates in counters[2 * level]
//   collect  accepted pixels appended to corners[level * capacity ..]
//            through the atomic cursor counters[2 * level + 1]
//
// The cursor keeps counting past `capacity`, so the host sees the true
// number of corners and logs the truncation. Slot order depends on
// scheduling; the host sorts each level by (y, x) after readback, which
// makes the result identical to `GridFast::detect`.
//
// All levels of a camera are recorded into one command buffer; the
// counters are cleared at its start.

use crate::config::FastConfig;
use crate::error::{ExtractorError, Result};
use crate::fast::{cell_grid, sort_corners, Cell, Corner, CIRCLE_RADIUS};
use crate::gpu::buffer::{DeviceArray, DeviceImage};
use crate::gpu::device::DeviceContext;
use crate::gpu::kernels::{self, ShaderSet};

// Must match WGSL struct Params in fast.wgsl.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct FastParams {
    img_origin: u32,
    img_step: u32,
    mask_origin: u32,
    mask_step: u32,
    cols: u32,
    rows: u32,
    lo: u32,
    has_mask: u32,
    num_rects: u32,
    nms: u32,
    ini_threshold: u32,
    min_threshold: u32,
    retry: u32,
    capacity: u32,
    counter_base: u32,
    out_base: u32,
    scale: f32,
    num_cells: u32,
    _pad: [u32; 2],
}

/// Device-side cell grid of one level.
pub struct LevelCells {
    cells: DeviceArray<Cell>,
    pub cols: usize,
    pub rows: usize,
}

impl LevelCells {
    pub fn new(ctx: &DeviceContext, cols: usize, rows: usize, cfg: &FastConfig) -> Result<Self> {
        let grid = cell_grid(cols, rows, cfg);
        Ok(LevelCells { cells: DeviceArray::from_slice(ctx, &grid, "fast cells")?, cols, rows })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Scratch and output buffers for up to `num_levels` levels.
pub struct FastScratch {
    scores: DeviceArray<i32>,
    cell_counts: DeviceArray<u32>,
    counters: DeviceArray<u32>,
    corners: DeviceArray<Corner>,
    pub capacity: usize,
    pub num_levels: usize,
}

impl FastScratch {
    /// `max_pixels` and `max_cells` must cover the largest level.
    pub fn new(
        ctx: &DeviceContext,
        max_pixels: usize,
        max_cells: usize,
        num_levels: usize,
        capacity: usize,
    ) -> Result<Self> {
        Ok(FastScratch {
            scores: DeviceArray::new(ctx, max_pixels, "fast scores")?,
            cell_counts: DeviceArray::new(ctx, max_cells, "fast cell counts")?,
            counters: DeviceArray::new(ctx, 2 * num_levels, "fast counters")?,
            corners: DeviceArray::new(ctx, capacity * num_levels, "fast corners")?,
            capacity,
            num_levels,
        })
    }

    /// Record a reset of every level's counters.
    pub fn record_clear(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(self.counters.buffer(), 0, Some(self.counters.byte_len()));
    }

    /// Download the corners of every level, sorted row-major. Blocks.
    pub fn read(&self, ctx: &DeviceContext) -> Result<Vec<Vec<Corner>>> {
        let counters = self.counters.read(ctx)?;
        let mut out = Vec::with_capacity(self.num_levels);
        for level in 0..self.num_levels {
            let found = counters[2 * level + 1] as usize;
            if found > self.capacity {
                log::warn!(
                    "level {level}: {found} raw corners exceed capacity {}, keeping the first {}",
                    self.capacity,
                    self.capacity
                );
            }
            let mut corners = self.corners.read_range(ctx, level * self.capacity, found.min(self.capacity))?;
            sort_corners(&mut corners);
            out.push(corners);
        }
        Ok(out)
    }
}

/// Inputs of one level's detection.
pub struct FastLevel<'a> {
    pub image: &'a DeviceImage,
    pub mask: Option<&'a DeviceImage>,
    pub cells: &'a LevelCells,
    /// Exclusion rectangles in full-resolution pixels.
    pub rects: &'a DeviceArray<[f32; 4]>,
    /// Full-resolution pixels per level pixel.
    pub scale: f32,
    pub level: usize,
}

pub struct GpuFast {
    score_pipeline: wgpu::ComputePipeline,
    count_pipeline: wgpu::ComputePipeline,
    collect_pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    pub config: FastConfig,
    pub ini_threshold: u8,
    pub min_threshold: u8,
}

impl GpuFast {
    pub fn new(
        ctx: &DeviceContext,
        shaders: &ShaderSet,
        config: FastConfig,
        ini_threshold: u8,
        min_threshold: u8,
    ) -> Result<Self> {
        let module = kernels::shader_module(ctx, "fast.wgsl", &shaders.fast)?;
        let bgl = kernels::bind_group_layout(
            ctx,
            "GpuFast BGL",
            &[
                kernels::storage_entry(0, true),  // img
                kernels::storage_entry(1, true),  // mask
                kernels::storage_entry(2, true),  // rects
                kernels::storage_entry(3, false), // scores
                kernels::storage_entry(4, true),  // cells
                kernels::storage_entry(5, false), // cell_counts
                kernels::storage_entry(6, false), // counters
                kernels::storage_entry(7, false), // corners
                kernels::uniform_entry(8),
            ],
        );
        Ok(GpuFast {
            score_pipeline: kernels::compute_pipeline(ctx, &module, &bgl, "score")?,
            count_pipeline: kernels::compute_pipeline(ctx, &module, &bgl, "count")?,
            collect_pipeline: kernels::compute_pipeline(ctx, &module, &bgl, "collect")?,
            bgl,
            config,
            ini_threshold,
            min_threshold,
        })
    }

    /// Record the three stages for one level without submitting.
    pub fn record_level(
        &self,
        ctx: &DeviceContext,
        encoder: &mut wgpu::CommandEncoder,
        level: &FastLevel<'_>,
        scratch: &FastScratch,
    ) -> Result<()> {
        let img = level.image;
        let (cols, rows) = (img.width(), img.height());
        if (level.cells.cols, level.cells.rows) != (cols, rows) {
            return Err(ExtractorError::SizeMismatch(format!(
                "cell grid for {}x{} used on a {cols}x{rows} level",
                level.cells.cols, level.cells.rows
            )));
        }
        if let Some(m) = level.mask {
            if (m.width(), m.height()) != (cols, rows) {
                return Err(ExtractorError::SizeMismatch(format!(
                    "mask is {}x{}, level is {cols}x{rows}",
                    m.width(),
                    m.height()
                )));
            }
        }
        if level.level >= scratch.num_levels
            || scratch.scores.len() < cols * rows
            || scratch.cell_counts.len() < level.cells.len()
        {
            return Err(ExtractorError::InvalidArgument(format!(
                "fast scratch too small for level {} ({cols}x{rows}, {} cells)",
                level.level,
                level.cells.len()
            )));
        }
        if level.cells.is_empty() {
            return Ok(());
        }

        let d = img.desc();
        // Without a mask the image itself is bound in the mask slot.
        let mask_img = level.mask.unwrap_or(img);
        let md = mask_img.desc();
        let params = FastParams {
            img_origin: d.origin,
            img_step: d.step,
            mask_origin: md.origin,
            mask_step: md.step,
            cols: d.cols,
            rows: d.rows,
            lo: (self.config.edge_clip + CIRCLE_RADIUS) as u32,
            has_mask: level.mask.is_some() as u32,
            num_rects: level.rects.len() as u32,
            nms: self.config.nms as u32,
            ini_threshold: self.ini_threshold as u32,
            min_threshold: self.min_threshold as u32,
            retry: self.config.retry.code(),
            capacity: scratch.capacity as u32,
            counter_base: (2 * level.level) as u32,
            out_base: (level.level * scratch.capacity) as u32,
            scale: level.scale,
            num_cells: level.cells.len() as u32,
            _pad: [0; 2],
        };
        let params_buf = kernels::uniform_buffer(ctx, &params, "GpuFast params");
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuFast BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: img.binding() },
                wgpu::BindGroupEntry { binding: 1, resource: mask_img.binding() },
                wgpu::BindGroupEntry { binding: 2, resource: level.rects.binding() },
                wgpu::BindGroupEntry { binding: 3, resource: scratch.scores.binding() },
                wgpu::BindGroupEntry { binding: 4, resource: level.cells.cells.binding() },
                wgpu::BindGroupEntry { binding: 5, resource: scratch.cell_counts.binding() },
                wgpu::BindGroupEntry { binding: 6, resource: scratch.counters.binding() },
                wgpu::BindGroupEntry { binding: 7, resource: scratch.corners.binding() },
                wgpu::BindGroupEntry { binding: 8, resource: params_buf.as_entire_binding() },
            ],
        });

        let (gx, gy) = ctx.dispatch_size(d.cols, d.rows);
        let n = params.num_cells;
        kernels::dispatch(encoder, "fast score", &self.score_pipeline, &bind_group, (gx, gy, 1));
        kernels::dispatch(encoder, "fast count", &self.count_pipeline, &bind_group, (n, 1, 1));
        kernels::dispatch(encoder, "fast collect", &self.collect_pipeline, &bind_group, (n, 1, 1));
        Ok(())
    }

    /// Detect corners on a single image. Blocks until the result is read.
    pub fn detect(
        &self,
        ctx: &DeviceContext,
        image: &DeviceImage,
        mask: Option<&DeviceImage>,
        rects: &[[f32; 4]],
        scale: f32,
    ) -> Result<Vec<Corner>> {
        let (cols, rows) = (image.width(), image.height());
        let cells = LevelCells::new(ctx, cols, rows, &self.config)?;
        let scratch = FastScratch::new(ctx, cols * rows, cells.len(), 1, self.config.max_raw_keypoints)?;
        let rects = DeviceArray::from_slice(ctx, rects, "fast rects")?;
        let level = FastLevel { image, mask, cells: &cells, rects: &rects, scale, level: 0 };

        let mut deps = vec![image.event()];
        if let Some(m) = mask {
            deps.push(m.event());
        }
        let ev = ctx.submit("fast", &deps, |enc| {
            scratch.record_clear(enc);
            self.record_level(ctx, enc, &level, &scratch)
        })?;
        ctx.wait(&ev)?;
        let mut levels = scratch.read(ctx)?;
        Ok(levels.pop().unwrap_or_default())
    }
}

// ============================================================
// Tests
// ============================================================
