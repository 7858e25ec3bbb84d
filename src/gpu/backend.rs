// gpu/backend.rs — device implementation of the extraction phases.
//
// Each camera owns a `CameraFrame`: three atlases (pyramid, blurred
// pyramid, mask pyramid) plus every per-level table the kernels need.
// Frames are built on first use and kept while the image size and the
// exclusion rectangles stay the same, so a steady video stream allocates
// nothing after the first call.
//
// Per camera and phase there is exactly one command buffer:
//
//   detect    clear counters, then per level:
//               resize (level > 0) ─► mask resize ─► blur ─► FAST
//   describe  one orientation + descriptor dispatch over all levels
//
// All cameras are submitted before the host waits on any of them.

use std::path::Path;

use crate::config::ExtractorConfig;
use crate::error::{ExtractorError, Result};
use crate::extractor::{Backend, CameraInput, LevelCorners, LevelDescriptions};
use crate::gpu::buffer::{DeviceArray, DeviceImage, ImageDesc};
use crate::gpu::device::{CompletionEvent, DeviceContext};
use crate::gpu::fast::{FastLevel, FastScratch, GpuFast, LevelCells};
use crate::gpu::gaussian::{BlurTables, GpuGaussian};
use crate::gpu::kernels::ShaderSet;
use crate::gpu::orb::{DescribeBatch, GpuOrb};
use crate::gpu::resize::{GpuResize, ResizeTables};
use crate::pyramid::PyramidLayout;

/// The compiled kernels. Rebuilt as a whole when sources are reloaded.
struct Kernels {
    resize: GpuResize,
    gaussian: GpuGaussian,
    fast: GpuFast,
    orb: GpuOrb,
}

impl Kernels {
    fn new(ctx: &DeviceContext, shaders: &ShaderSet, config: &ExtractorConfig) -> Result<Self> {
        Ok(Kernels {
            resize: GpuResize::new(ctx, shaders)?,
            gaussian: GpuGaussian::new(ctx, shaders, &config.blur)?,
            fast: GpuFast::new(
                ctx,
                shaders,
                config.fast.clone(),
                config.ini_fast_threshold,
                config.min_fast_threshold,
            )?,
            orb: GpuOrb::new(ctx, shaders)?,
        })
    }
}

/// Mask pyramid: level 0 is the uploaded mask, level i > 0 is sampled
/// from level 0 at `(x * s_i, y * s_i)`.
struct MaskAtlas {
    levels: Vec<DeviceImage>,
    tables: Vec<ResizeTables>,
}

impl MaskAtlas {
    fn new(ctx: &DeviceContext, layout: &PyramidLayout) -> Result<Self> {
        let atlas = DeviceImage::new(ctx, layout.atlas_cols, layout.atlas_rows, "mask atlas")?;
        let levels = layout.levels.iter().map(|l| atlas.view(l.rect())).collect::<Result<Vec<_>>>()?;
        let tables = (1..layout.num_levels())
            .map(|i| ResizeTables::upload(ctx, &layout.mask_plan(i)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(MaskAtlas { levels, tables })
    }
}

/// Device state of one camera.
struct CameraFrame {
    layout: PyramidLayout,
    rects_host: Vec<[f32; 4]>,
    pyramid: DeviceImage,
    blurred: DeviceImage,
    levels: Vec<DeviceImage>,
    blurred_levels: Vec<DeviceImage>,
    /// `level_tables[i - 1]` produces level i from level i - 1.
    level_tables: Vec<ResizeTables>,
    blur_tables: Vec<BlurTables>,
    cells: Vec<LevelCells>,
    masks: Option<MaskAtlas>,
    rects: DeviceArray<[f32; 4]>,
    level_descs: DeviceArray<ImageDesc>,
    tmp: DeviceArray<u32>,
    scratch: FastScratch,
    event: CompletionEvent,
    pending: Option<DescribeBatch>,
}

impl CameraFrame {
    fn new(ctx: &DeviceContext, kernels: &Kernels, input: &CameraInput<'_>) -> Result<Self> {
        let layout = input.layout.clone();
        let (cols, rows) = (layout.atlas_cols, layout.atlas_rows);
        let pyramid = DeviceImage::new(ctx, cols, rows, "pyramid atlas")?;
        let blurred = DeviceImage::new(ctx, cols, rows, "blurred atlas")?;
        let levels = layout.levels.iter().map(|l| pyramid.view(l.rect())).collect::<Result<Vec<_>>>()?;
        let blurred_levels = layout.levels.iter().map(|l| blurred.view(l.rect())).collect::<Result<Vec<_>>>()?;
        let level_tables = (1..layout.num_levels())
            .map(|i| ResizeTables::upload(ctx, &layout.level_plan(i)?))
            .collect::<Result<Vec<_>>>()?;
        let blur_tables = layout
            .levels
            .iter()
            .map(|l| kernels.gaussian.tables(ctx, l.cols, l.rows))
            .collect::<Result<Vec<_>>>()?;
        let cells = layout
            .levels
            .iter()
            .map(|l| LevelCells::new(ctx, l.cols, l.rows, &kernels.fast.config))
            .collect::<Result<Vec<_>>>()?;

        let l0 = &layout.levels[0];
        let max_cells = cells.iter().map(LevelCells::len).max().unwrap_or(0);
        let scratch = FastScratch::new(
            ctx,
            l0.cols * l0.rows,
            max_cells,
            layout.num_levels(),
            kernels.fast.config.max_raw_keypoints,
        )?;
        let descs: Vec<ImageDesc> = levels.iter().map(DeviceImage::desc).collect();

        log::debug!(
            "camera frame {}x{}: {} levels, atlas {}x{}",
            l0.cols,
            l0.rows,
            layout.num_levels(),
            cols,
            rows
        );
        Ok(CameraFrame {
            rects_host: input.rects.clone(),
            rects: DeviceArray::from_slice(ctx, &input.rects, "exclusion rects")?,
            level_descs: DeviceArray::from_slice(ctx, &descs, "level descs")?,
            tmp: DeviceArray::new(ctx, l0.cols * l0.rows, "blur tmp")?,
            event: CompletionEvent::completed(ctx.id()),
            masks: None,
            pending: None,
            layout,
            pyramid,
            blurred,
            levels,
            blurred_levels,
            level_tables,
            blur_tables,
            cells,
            scratch,
        })
    }

    fn fits(&self, input: &CameraInput<'_>) -> bool {
        self.layout == input.layout && self.rects_host == input.rects
    }

    /// Record the detect phase. Level 0 (and mask level 0) must already
    /// hold the uploaded images.
    fn record_detect(
        &self,
        ctx: &DeviceContext,
        kernels: &Kernels,
        use_mask: bool,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<()> {
        let masks = if use_mask { self.masks.as_ref() } else { None };
        self.scratch.record_clear(encoder);
        for (i, info) in self.layout.levels.iter().enumerate() {
            if i > 0 {
                kernels.resize.record(ctx, encoder, &self.levels[i - 1], &self.levels[i], &self.level_tables[i - 1])?;
                if let Some(m) = masks {
                    kernels.resize.record(ctx, encoder, &m.levels[0], &m.levels[i], &m.tables[i - 1])?;
                }
            }
            kernels.gaussian.record(
                ctx,
                encoder,
                &self.levels[i],
                &self.blurred_levels[i],
                &self.tmp,
                &self.blur_tables[i],
            )?;
            let level = FastLevel {
                image: &self.levels[i],
                mask: masks.map(|m| &m.levels[i]),
                cells: &self.cells[i],
                rects: &self.rects,
                scale: info.scale,
                level: i,
            };
            kernels.fast.record_level(ctx, encoder, &level, &self.scratch)?;
        }
        Ok(())
    }
}

/// wgpu implementation of [`Backend`].
pub struct GpuBackend {
    ctx: DeviceContext,
    kernels: Kernels,
    config: ExtractorConfig,
    frames: Vec<CameraFrame>,
    name: String,
}

impl GpuBackend {
    /// Open a device of `config.device` and compile the kernels, from
    /// `config.kernel_path` when set.
    pub fn new(config: &ExtractorConfig) -> Result<Self> {
        let mut ctx = DeviceContext::new(config.device)?;
        ctx.set_poll_interval(config.poll_interval());
        let shaders = ShaderSet::load(config.kernel_path.as_deref())?;
        let kernels = Kernels::new(&ctx, &shaders, config)?;
        let name = format!("gpu ({})", ctx.info().name);
        log::info!("GPU backend ready: {ctx}");
        Ok(GpuBackend { ctx, kernels, config: config.clone(), frames: Vec::new(), name })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    fn prepare_frame(&mut self, cam: usize, input: &CameraInput<'_>) -> Result<()> {
        let stale = self.frames.get(cam).map_or(true, |f| !f.fits(input));
        if stale {
            let frame = CameraFrame::new(&self.ctx, &self.kernels, input)?;
            if cam < self.frames.len() {
                self.frames[cam] = frame;
            } else {
                self.frames.push(frame);
            }
        }
        let frame = &mut self.frames[cam];
        if input.mask.is_some() && frame.masks.is_none() {
            frame.masks = Some(MaskAtlas::new(&self.ctx, &frame.layout)?);
        }
        Ok(())
    }

    fn submit_camera(&mut self, cam: usize, input: &CameraInput<'_>) -> Result<()> {
        self.prepare_frame(cam, input)?;
        let ctx = &self.ctx;
        let kernels = &self.kernels;
        let frame = &mut self.frames[cam];

        frame.levels[0].upload(ctx, input.image)?;
        let mut deps = frame.levels[0].event().clone();
        if let (Some(mask), Some(atlas)) = (input.mask, frame.masks.as_mut()) {
            atlas.levels[0].upload(ctx, mask)?;
            deps.merge(atlas.levels[0].event());
        }
        let frame = &*frame;
        let use_mask = input.mask.is_some();
        let event = ctx.submit("detect", &[&deps], |enc| frame.record_detect(ctx, kernels, use_mask, enc))?;
        self.frames[cam].event = event;
        Ok(())
    }
}

impl Backend for GpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit_detect(&mut self, inputs: &[CameraInput<'_>]) -> Result<()> {
        self.ctx.check()?;
        for (cam, input) in inputs.iter().enumerate() {
            self.submit_camera(cam, input).map_err(|e| e.for_camera(cam))?;
        }
        self.frames.truncate(inputs.len());
        Ok(())
    }

    fn finish_detect(&mut self) -> Result<Vec<LevelCorners>> {
        let mut out = Vec::with_capacity(self.frames.len());
        for (cam, frame) in self.frames.iter().enumerate() {
            self.ctx.wait(&frame.event).map_err(|e| e.for_camera(cam))?;
            out.push(frame.scratch.read(&self.ctx).map_err(|e| e.for_camera(cam))?);
        }
        Ok(out)
    }

    fn submit_describe(&mut self, corners: &[LevelCorners]) -> Result<()> {
        if corners.len() != self.frames.len() {
            return Err(ExtractorError::SizeMismatch(format!(
                "corners for {} cameras, {} detected",
                corners.len(),
                self.frames.len()
            )));
        }
        let ctx = &self.ctx;
        let orb = &self.kernels.orb;
        for (cam, (frame, levels)) in self.frames.iter_mut().zip(corners).enumerate() {
            let batch = DescribeBatch::new(ctx, levels).map_err(|e| e.for_camera(cam))?;
            let f = &*frame;
            let event = ctx
                .submit("describe", &[&f.event], |enc| {
                    orb.record(ctx, enc, &f.pyramid, &f.blurred, &f.level_descs, &batch)
                })
                .map_err(|e| e.for_camera(cam))?;
            frame.event = event;
            frame.pending = Some(batch);
        }
        Ok(())
    }

    fn finish_describe(&mut self) -> Result<Vec<LevelDescriptions>> {
        let mut out = Vec::with_capacity(self.frames.len());
        for (cam, frame) in self.frames.iter_mut().enumerate() {
            let batch = frame.pending.take().ok_or_else(|| {
                ExtractorError::InvalidArgument(format!("camera {cam}: finish_describe without submit_describe"))
            })?;
            self.ctx.wait(&frame.event).map_err(|e| e.for_camera(cam))?;
            out.push(batch.read(&self.ctx).map_err(|e| e.for_camera(cam))?);
        }
        Ok(out)
    }

    fn reload_kernels(&mut self, dir: &Path) -> Result<()> {
        let shaders = ShaderSet::from_dir(dir)?;
        self.kernels = Kernels::new(&self.ctx, &shaders, &self.config)?;
        log::info!("kernels reloaded from {}", dir.display());
        Ok(())
    }

    fn check(&self) -> Result<()> {
        self.ctx.check()
    }
}
