// gpu/orb.rs — orientation and rotated BRIEF on the device.
//
// One dispatch per camera covers every level: keypoints carry their level
// index, and a small table maps the index to the level's view (origin,
// step, cols, rows). The unblurred and blurred atlases are allocated with
// the same geometry, so the same table addresses both.
//
// The kernel evaluates the same polynomials as crate::orb. Moments are
// integer sums and match exactly; the angle and the rotated sample
// positions are f32 and may differ in the last bits where the GPU fuses
// multiply-adds, so parity is checked with a tolerance.

use crate::error::{ExtractorError, Result};
use crate::fast::Corner;
use crate::gpu::buffer::{DeviceArray, DeviceImage, ImageDesc};
use crate::gpu::device::DeviceContext;
use crate::gpu::kernels::{self, ShaderSet};
use crate::orb::{umax_table, Descriptor, DESCRIPTOR_BYTES};
use crate::pattern::BIT_PATTERN_31;

const WORDS_PER_DESCRIPTOR: usize = DESCRIPTOR_BYTES / 4;

// Must match WGSL struct Params in orb.wgsl.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct OrbParams {
    count: u32,
    _pad: [u32; 3],
}

/// Keypoints of one camera and room for their results.
pub struct DescribeBatch {
    keypoints: DeviceArray<[i32; 4]>,
    angles: DeviceArray<f32>,
    descriptors: DeviceArray<u32>,
    /// Number of keypoints per level, in level order.
    pub level_counts: Vec<usize>,
}

impl DescribeBatch {
    /// Upload `corners[level]` for every level.
    pub fn new(ctx: &DeviceContext, corners: &[Vec<Corner>]) -> Result<Self> {
        let packed: Vec<[i32; 4]> = corners
            .iter()
            .enumerate()
            .flat_map(|(level, cs)| cs.iter().map(move |c| [c.x, c.y, level as i32, 0]))
            .collect();
        let n = packed.len();
        Ok(DescribeBatch {
            keypoints: DeviceArray::from_slice(ctx, &packed, "orb keypoints")?,
            angles: DeviceArray::new(ctx, n, "orb angles")?,
            descriptors: DeviceArray::new(ctx, n * WORDS_PER_DESCRIPTOR, "orb descriptors")?,
            level_counts: corners.iter().map(Vec::len).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Download angles and descriptors, split per level. Blocks.
    pub fn read(&self, ctx: &DeviceContext) -> Result<Vec<(Vec<f32>, Vec<Descriptor>)>> {
        let angles = self.angles.read(ctx)?;
        let words = self.descriptors.read(ctx)?;
        let descriptors: Vec<Descriptor> = words.chunks_exact(WORDS_PER_DESCRIPTOR).map(pack_descriptor).collect();

        let mut out = Vec::with_capacity(self.level_counts.len());
        let mut start = 0;
        for &n in &self.level_counts {
            out.push((angles[start..start + n].to_vec(), descriptors[start..start + n].to_vec()));
            start += n;
        }
        Ok(out)
    }
}

/// Eight little-endian words to 32 descriptor bytes.
fn pack_descriptor(words: &[u32]) -> Descriptor {
    let mut d = [0u8; DESCRIPTOR_BYTES];
    for (chunk, w) in d.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
    d
}

pub struct GpuOrb {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    pattern: DeviceArray<[i32; 4]>,
    umax: DeviceArray<i32>,
}

impl GpuOrb {
    pub fn new(ctx: &DeviceContext, shaders: &ShaderSet) -> Result<Self> {
        let module = kernels::shader_module(ctx, "orb.wgsl", &shaders.orb)?;
        let bgl = kernels::bind_group_layout(
            ctx,
            "GpuOrb BGL",
            &[
                kernels::storage_entry(0, true),  // img
                kernels::storage_entry(1, true),  // blurred
                kernels::storage_entry(2, true),  // levels
                kernels::storage_entry(3, true),  // keypoints
                kernels::storage_entry(4, true),  // pattern
                kernels::storage_entry(5, true),  // umax
                kernels::storage_entry(6, false), // angles
                kernels::storage_entry(7, false), // descriptors
                kernels::uniform_entry(8),
            ],
        );
        let pattern: Vec<[i32; 4]> = BIT_PATTERN_31
            .iter()
            .map(|p| [p[0] as i32, p[1] as i32, p[2] as i32, p[3] as i32])
            .collect();
        Ok(GpuOrb {
            pipeline: kernels::compute_pipeline(ctx, &module, &bgl, "describe")?,
            bgl,
            pattern: DeviceArray::from_slice(ctx, &pattern, "orb pattern")?,
            umax: DeviceArray::from_slice(ctx, &umax_table(), "orb umax")?,
        })
    }

    /// Record the dispatch for `batch`. `levels[i]` is the geometry of
    /// level i in both `image` and `blurred`.
    pub fn record(
        &self,
        ctx: &DeviceContext,
        encoder: &mut wgpu::CommandEncoder,
        image: &DeviceImage,
        blurred: &DeviceImage,
        levels: &DeviceArray<ImageDesc>,
        batch: &DescribeBatch,
    ) -> Result<()> {
        if image.elem_step != blurred.elem_step || image.rows != blurred.rows {
            return Err(ExtractorError::SizeMismatch(format!(
                "image and blurred atlases differ: step {} vs {}, rows {} vs {}",
                image.elem_step, blurred.elem_step, image.rows, blurred.rows
            )));
        }
        if batch.level_counts.len() > levels.len() {
            return Err(ExtractorError::InvalidArgument(format!(
                "{} keypoint levels but only {} level descriptors",
                batch.level_counts.len(),
                levels.len()
            )));
        }
        if batch.is_empty() {
            return Ok(());
        }
        let params = OrbParams { count: batch.len() as u32, _pad: [0; 3] };
        let params_buf = kernels::uniform_buffer(ctx, &params, "GpuOrb params");
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuOrb BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: image.binding() },
                wgpu::BindGroupEntry { binding: 1, resource: blurred.binding() },
                wgpu::BindGroupEntry { binding: 2, resource: levels.binding() },
                wgpu::BindGroupEntry { binding: 3, resource: batch.keypoints.binding() },
                wgpu::BindGroupEntry { binding: 4, resource: self.pattern.binding() },
                wgpu::BindGroupEntry { binding: 5, resource: self.umax.binding() },
                wgpu::BindGroupEntry { binding: 6, resource: batch.angles.binding() },
                wgpu::BindGroupEntry { binding: 7, resource: batch.descriptors.binding() },
                wgpu::BindGroupEntry { binding: 8, resource: params_buf.as_entire_binding() },
            ],
        });
        let groups = ctx.dispatch_1d(params.count);
        kernels::dispatch(encoder, "orb describe", &self.pipeline, &bind_group, (groups, 1, 1));
        Ok(())
    }

    /// Describe corners of a single level. Blocks until the result is read.
    pub fn describe(
        &self,
        ctx: &DeviceContext,
        image: &DeviceImage,
        blurred: &DeviceImage,
        corners: &[Corner],
    ) -> Result<(Vec<f32>, Vec<Descriptor>)> {
        if image.desc() != blurred.desc() {
            return Err(ExtractorError::SizeMismatch(format!(
                "image view {:?} and blurred view {:?} differ",
                image.desc(),
                blurred.desc()
            )));
        }
        let levels = DeviceArray::from_slice(ctx, &[image.desc()], "orb levels")?;
        let batch = DescribeBatch::new(ctx, &[corners.to_vec()])?;
        let ev = ctx.submit("orb", &[image.event(), blurred.event()], |enc| {
            self.record(ctx, enc, image, blurred, &levels, &batch)
        })?;
        ctx.wait(&ev)?;
        let mut out = batch.read(ctx)?;
        Ok(out.pop().unwrap_or_default())
    }
}
