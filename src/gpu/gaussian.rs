// gpu/gaussian.rs — separable Gaussian blur on the device.
//
// Two dispatches per image, both from shaders/gaussian.wgsl:
//
//   blur_rows   src (u8)  -> tmp (u32, one word per pixel, tightly packed)
//   blur_cols   tmp (u32) -> dst (u8, word writer)
//
// `tmp` is scratch owned by the caller so one buffer sized for the largest
// level serves a whole pyramid. Weights and border tap tables are the ones
// crate::gaussian uses, so the output matches `gaussian_blur` exactly.

use crate::config::BlurConfig;
use crate::error::{ExtractorError, Result};
use crate::gaussian::{gaussian_kernel_q8, tap_table, BorderType};
use crate::gpu::buffer::{DeviceArray, DeviceImage};
use crate::gpu::device::{CompletionEvent, DeviceContext};
use crate::gpu::kernels::{self, ShaderSet};

// Must match WGSL struct Params in gaussian.wgsl.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GaussianParams {
    src_origin: u32,
    src_step: u32,
    dst_origin: u32,
    dst_step: u32,
    cols: u32,
    rows: u32,
    ksize: u32,
    words_per_row: u32,
}

/// Border tap tables for one image size.
pub struct BlurTables {
    xtaps: DeviceArray<i32>,
    ytaps: DeviceArray<i32>,
    pub cols: usize,
    pub rows: usize,
}

impl BlurTables {
    pub fn upload(ctx: &DeviceContext, cols: usize, rows: usize, ksize: usize, border: BorderType) -> Result<Self> {
        Ok(BlurTables {
            xtaps: DeviceArray::from_slice(ctx, &tap_table(cols, ksize, border), "blur xtaps")?,
            ytaps: DeviceArray::from_slice(ctx, &tap_table(rows, ksize, border), "blur ytaps")?,
            cols,
            rows,
        })
    }
}

pub struct GpuGaussian {
    rows_pipeline: wgpu::ComputePipeline,
    cols_pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    weights: DeviceArray<u32>,
    pub ksize: usize,
    pub border: BorderType,
}

impl GpuGaussian {
    /// # Errors
    /// `InvalidArgument` for an even or oversized kernel or a bad sigma.
    pub fn new(ctx: &DeviceContext, shaders: &ShaderSet, cfg: &BlurConfig) -> Result<Self> {
        let q8 = gaussian_kernel_q8(cfg.kernel_size, cfg.sigma)?;
        let module = kernels::shader_module(ctx, "gaussian.wgsl", &shaders.gaussian)?;
        let bgl = kernels::bind_group_layout(
            ctx,
            "GpuGaussian BGL",
            &[
                kernels::storage_entry(0, true),  // src
                kernels::storage_entry(1, false), // tmp
                kernels::storage_entry(2, false), // dst
                kernels::storage_entry(3, true),  // weights
                kernels::storage_entry(4, true),  // xtaps
                kernels::storage_entry(5, true),  // ytaps
                kernels::uniform_entry(6),
            ],
        );
        Ok(GpuGaussian {
            rows_pipeline: kernels::compute_pipeline(ctx, &module, &bgl, "blur_rows")?,
            cols_pipeline: kernels::compute_pipeline(ctx, &module, &bgl, "blur_cols")?,
            bgl,
            weights: DeviceArray::from_slice(ctx, &q8, "blur weights")?,
            ksize: cfg.kernel_size,
            border: cfg.border,
        })
    }

    /// Tap tables for a `cols × rows` image with this kernel's settings.
    pub fn tables(&self, ctx: &DeviceContext, cols: usize, rows: usize) -> Result<BlurTables> {
        BlurTables::upload(ctx, cols, rows, self.ksize, self.border)
    }

    /// Record both passes without submitting.
    pub fn record(
        &self,
        ctx: &DeviceContext,
        encoder: &mut wgpu::CommandEncoder,
        src: &DeviceImage,
        dst: &DeviceImage,
        tmp: &DeviceArray<u32>,
        tables: &BlurTables,
    ) -> Result<()> {
        let dims = (tables.cols, tables.rows);
        if (src.width(), src.height()) != dims || (dst.width(), dst.height()) != dims {
            return Err(ExtractorError::SizeMismatch(format!(
                "blur tables are {}x{}, views are {}x{} -> {}x{}",
                dims.0,
                dims.1,
                src.width(),
                src.height(),
                dst.width(),
                dst.height()
            )));
        }
        if tmp.len() < dims.0 * dims.1 {
            return Err(ExtractorError::InvalidArgument(format!(
                "blur scratch holds {} words, {}x{} needs {}",
                tmp.len(),
                dims.0,
                dims.1,
                dims.0 * dims.1
            )));
        }
        if src.aliases(dst) {
            return Err(ExtractorError::InvalidArgument("blur source and destination share a buffer".into()));
        }
        dst.check_writable()?;

        let (s, d) = (src.desc(), dst.desc());
        let params = GaussianParams {
            src_origin: s.origin,
            src_step: s.step,
            dst_origin: d.origin,
            dst_step: d.step,
            cols: d.cols,
            rows: d.rows,
            ksize: self.ksize as u32,
            words_per_row: d.words_per_row(),
        };
        let params_buf = kernels::uniform_buffer(ctx, &params, "GpuGaussian params");
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuGaussian BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: src.binding() },
                wgpu::BindGroupEntry { binding: 1, resource: tmp.binding() },
                wgpu::BindGroupEntry { binding: 2, resource: dst.binding() },
                wgpu::BindGroupEntry { binding: 3, resource: self.weights.binding() },
                wgpu::BindGroupEntry { binding: 4, resource: tables.xtaps.binding() },
                wgpu::BindGroupEntry { binding: 5, resource: tables.ytaps.binding() },
                wgpu::BindGroupEntry { binding: 6, resource: params_buf.as_entire_binding() },
            ],
        });
        let (rx, ry) = ctx.dispatch_size(params.cols, params.rows);
        kernels::dispatch(encoder, "blur_rows", &self.rows_pipeline, &bind_group, (rx, ry, 1));
        let (cx, cy) = ctx.dispatch_size(params.words_per_row, params.rows);
        kernels::dispatch(encoder, "blur_cols", &self.cols_pipeline, &bind_group, (cx, cy, 1));
        Ok(())
    }

    /// Blur `src` into `dst`. Returns without waiting.
    pub fn blur(&self, ctx: &DeviceContext, src: &DeviceImage, dst: &mut DeviceImage) -> Result<CompletionEvent> {
        let tables = self.tables(ctx, src.width(), src.height())?;
        let tmp = DeviceArray::<u32>::new(ctx, src.width() * src.height(), "blur tmp")?;
        let ev = ctx.submit("gaussian", &[src.event(), dst.event()], |enc| {
            self.record(ctx, enc, src, dst, &tmp, &tables)
        })?;
        dst.set_event(ev.clone());
        Ok(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::gaussian_blur;
    use crate::gpu::device::tests::run_gpu_test_in_subprocess;
    use crate::gpu::device::DeviceClass;
    use crate::image::Image;

    fn noise(w: usize, h: usize, seed: u32) -> Image<u8> {
        let mut rng = seed;
        Image::from_vec(w, h, (0..w * h).map(|_| {
            rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
            (rng >> 24) as u8
        }).collect())
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_blur_matches_cpu() {
        let ctx = DeviceContext::new(DeviceClass::Default).unwrap();
        let shaders = ShaderSet::embedded();
        let img = noise(131, 77, 8);
        let src = DeviceImage::from_image(&ctx, &img, "src").unwrap();
        for border in [BorderType::Constant, BorderType::Replicate, BorderType::Reflect, BorderType::Reflect101] {
            let cfg = BlurConfig { kernel_size: 7, sigma: 2.0, border };
            let kernel = GpuGaussian::new(&ctx, &shaders, &cfg).unwrap();
            let mut dst = DeviceImage::new(&ctx, 131, 77, "dst").unwrap();
            let ev = kernel.blur(&ctx, &src, &mut dst).unwrap();
            ctx.wait(&ev).unwrap();
            let expect = gaussian_blur(&img, 7, 2.0, border).unwrap();
            assert_eq!(dst.download(&ctx).unwrap(), expect, "{border:?}");
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_blur_rejects_even_kernel() {
        let ctx = DeviceContext::new(DeviceClass::Default).unwrap();
        let cfg = BlurConfig { kernel_size: 6, ..BlurConfig::default() };
        let err = GpuGaussian::new(&ctx, &ShaderSet::embedded(), &cfg);
        assert!(matches!(err, Err(ExtractorError::InvalidArgument(_))));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_blur_matches_cpu() {
        let out = run_gpu_test_in_subprocess("gpu::gaussian::tests::inner_blur_matches_cpu");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_blur_rejects_even_kernel() {
        let out = run_gpu_test_in_subprocess("gpu::gaussian::tests::inner_blur_rejects_even_kernel");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
