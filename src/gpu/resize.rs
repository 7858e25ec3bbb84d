// gpu/resize.rs — device resize driven by host-computed tap tables.
//
// `ResizePlan` (crate::resize) does every floating-point step once per
// column and once per row. This module uploads those tables and runs
// shaders/resize.wgsl, which only multiplies and shifts integers, so the
// result is bit-identical to `resize::apply`.
//
// Source and destination may be views of one allocation: the pyramid
// resizes level i-1 into level i inside the same atlas. The destination
// view must start on a word boundary (see gpu/buffer.rs).

use crate::error::{ExtractorError, Result};
use crate::gpu::buffer::{DeviceArray, DeviceImage};
use crate::gpu::device::{CompletionEvent, DeviceContext};
use crate::gpu::kernels::{self, ShaderSet};
use crate::resize::{AxisTap, ResizePlan};

// Must match WGSL struct Params in resize.wgsl.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ResizeParams {
    src_origin: u32,
    src_step: u32,
    src_cols: u32,
    src_rows: u32,
    dst_origin: u32,
    dst_step: u32,
    dst_cols: u32,
    dst_rows: u32,
    words_per_row: u32,
    _pad: [u32; 3],
}

/// A `ResizePlan` resident on the device.
pub struct ResizeTables {
    pub x: DeviceArray<AxisTap>,
    pub y: DeviceArray<AxisTap>,
    pub src_cols: usize,
    pub src_rows: usize,
    pub dst_cols: usize,
    pub dst_rows: usize,
}

impl ResizeTables {
    pub fn upload(ctx: &DeviceContext, plan: &ResizePlan) -> Result<Self> {
        Ok(ResizeTables {
            x: DeviceArray::from_slice(ctx, &plan.x, "resize xtab")?,
            y: DeviceArray::from_slice(ctx, &plan.y, "resize ytab")?,
            src_cols: plan.src_cols,
            src_rows: plan.src_rows,
            dst_cols: plan.dst_cols,
            dst_rows: plan.dst_rows,
        })
    }
}

pub struct GpuResize {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl GpuResize {
    pub fn new(ctx: &DeviceContext, shaders: &ShaderSet) -> Result<Self> {
        let module = kernels::shader_module(ctx, "resize.wgsl", &shaders.resize)?;
        let bgl = kernels::bind_group_layout(
            ctx,
            "GpuResize BGL",
            &[
                kernels::storage_entry(0, false), // src (may alias dst)
                kernels::storage_entry(1, false), // dst
                kernels::storage_entry(2, true),  // xtab
                kernels::storage_entry(3, true),  // ytab
                kernels::uniform_entry(4),
            ],
        );
        let pipeline = kernels::compute_pipeline(ctx, &module, &bgl, "resize")?;
        Ok(GpuResize { pipeline, bgl })
    }

    /// Record the resize of `src` into `dst` without submitting.
    pub fn record(
        &self,
        ctx: &DeviceContext,
        encoder: &mut wgpu::CommandEncoder,
        src: &DeviceImage,
        dst: &DeviceImage,
        tables: &ResizeTables,
    ) -> Result<()> {
        if (src.width(), src.height()) != (tables.src_cols, tables.src_rows)
            || (dst.width(), dst.height()) != (tables.dst_cols, tables.dst_rows)
        {
            return Err(ExtractorError::SizeMismatch(format!(
                "resize tables are {}x{} -> {}x{}, views are {}x{} -> {}x{}",
                tables.src_cols,
                tables.src_rows,
                tables.dst_cols,
                tables.dst_rows,
                src.width(),
                src.height(),
                dst.width(),
                dst.height()
            )));
        }
        dst.check_writable()?;

        let (s, d) = (src.desc(), dst.desc());
        let params = ResizeParams {
            src_origin: s.origin,
            src_step: s.step,
            src_cols: s.cols,
            src_rows: s.rows,
            dst_origin: d.origin,
            dst_step: d.step,
            dst_cols: d.cols,
            dst_rows: d.rows,
            words_per_row: d.words_per_row(),
            _pad: [0; 3],
        };
        let params_buf = kernels::uniform_buffer(ctx, &params, "GpuResize params");
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuResize BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: src.binding() },
                wgpu::BindGroupEntry { binding: 1, resource: dst.binding() },
                wgpu::BindGroupEntry { binding: 2, resource: tables.x.binding() },
                wgpu::BindGroupEntry { binding: 3, resource: tables.y.binding() },
                wgpu::BindGroupEntry { binding: 4, resource: params_buf.as_entire_binding() },
            ],
        });
        let (gx, gy) = ctx.dispatch_size(params.words_per_row, params.dst_rows);
        kernels::dispatch(encoder, "resize", &self.pipeline, &bind_group, (gx, gy, 1));
        Ok(())
    }

    /// Resize `src` into `dst` following `plan`. Returns without waiting;
    /// `dst` carries the completion event.
    pub fn resize(
        &self,
        ctx: &DeviceContext,
        src: &DeviceImage,
        dst: &mut DeviceImage,
        plan: &ResizePlan,
    ) -> Result<CompletionEvent> {
        let tables = ResizeTables::upload(ctx, plan)?;
        let ev = ctx.submit("resize", &[src.event(), dst.event()], |enc| {
            self.record(ctx, enc, src, dst, &tables)
        })?;
        dst.set_event(ev.clone());
        Ok(ev)
    }
}
