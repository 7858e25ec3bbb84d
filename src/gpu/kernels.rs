// gpu/kernels.rs — WGSL source loading and pipeline helpers.
//
// The four kernels ship embedded in the binary (`include_str!`). A host
// application may instead point the extractor at a directory holding
// `resize.wgsl`, `gaussian.wgsl`, `fast.wgsl` and `orb.wgsl`; every file
// must be present, and a file that fails to compile is reported as
// `DeviceUnavailable` when the pipelines are built.
//
// Sources are templates: `{{WG_X}}` / `{{WG_Y}}` become the 2D workgroup
// size of the context and `{{WG_1D}}` the 1D size used by per-cell and
// per-keypoint kernels. They are substituted into the source rather than
// passed as pipeline `override` constants because naga, as shipped with
// wgpu 22, rejects override expressions inside @workgroup_size().

use std::path::Path;

use crate::error::{ExtractorError, Result};
use crate::gpu::device::{DeviceContext, WorkgroupSize, WORKGROUP_1D};

/// Kernel file stems, in load order.
pub const KERNEL_NAMES: [&str; 4] = ["resize", "gaussian", "fast", "orb"];

/// The WGSL sources of all kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderSet {
    pub resize: String,
    pub gaussian: String,
    pub fast: String,
    pub orb: String,
}

impl ShaderSet {
    /// Sources compiled into the crate.
    pub fn embedded() -> Self {
        ShaderSet {
            resize: include_str!("../shaders/resize.wgsl").to_string(),
            gaussian: include_str!("../shaders/gaussian.wgsl").to_string(),
            fast: include_str!("../shaders/fast.wgsl").to_string(),
            orb: include_str!("../shaders/orb.wgsl").to_string(),
        }
    }

    /// Load `<dir>/<name>.wgsl` for every kernel.
    ///
    /// # Errors
    /// `DeviceUnavailable` if any file is missing or unreadable.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let load = |name: &str| {
            let path = dir.join(format!("{name}.wgsl"));
            std::fs::read_to_string(&path).map_err(|e| {
                ExtractorError::DeviceUnavailable(format!("cannot load kernel {}: {e}", path.display()))
            })
        };
        let set = ShaderSet {
            resize: load(KERNEL_NAMES[0])?,
            gaussian: load(KERNEL_NAMES[1])?,
            fast: load(KERNEL_NAMES[2])?,
            orb: load(KERNEL_NAMES[3])?,
        };
        log::info!("loaded kernels from {}", dir.display());
        Ok(set)
    }

    /// Embedded sources, or those under `dir` when given.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(d) => Self::from_dir(d),
            None => Ok(Self::embedded()),
        }
    }
}

/// Substitute the workgroup placeholders.
pub fn instantiate(template: &str, wg: WorkgroupSize) -> String {
    template
        .replace("{{WG_X}}", &wg.x.to_string())
        .replace("{{WG_Y}}", &wg.y.to_string())
        .replace("{{WG_1D}}", &WORKGROUP_1D.to_string())
}

/// Compile a kernel template, mapping WGSL errors to `DeviceUnavailable`.
pub fn shader_module(ctx: &DeviceContext, name: &str, template: &str) -> Result<wgpu::ShaderModule> {
    let source = instantiate(template, ctx.workgroup_size);
    ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(name),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
        return Err(ExtractorError::DeviceUnavailable(format!("kernel {name} failed to compile: {err}")));
    }
    Ok(module)
}

/// Storage buffer binding visible to compute.
pub fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Uniform buffer binding visible to compute.
pub fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub fn bind_group_layout(
    ctx: &DeviceContext,
    label: &str,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> wgpu::BindGroupLayout {
    ctx.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor { label: Some(label), entries })
}

/// Compute pipeline for `entry_point` with a single bind group.
pub fn compute_pipeline(
    ctx: &DeviceContext,
    module: &wgpu::ShaderModule,
    bgl: &wgpu::BindGroupLayout,
    entry_point: &str,
) -> Result<wgpu::ComputePipeline> {
    let layout = ctx.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(entry_point),
        bind_group_layouts: &[bgl],
        push_constant_ranges: &[],
    });
    ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let pipeline = ctx.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry_point),
        layout: Some(&layout),
        module,
        entry_point,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });
    if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
        return Err(ExtractorError::DeviceUnavailable(format!("pipeline {entry_point}: {err}")));
    }
    Ok(pipeline)
}

/// A uniform buffer holding `value`.
pub fn uniform_buffer<T: bytemuck::Pod>(ctx: &DeviceContext, value: &T, label: &str) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;
    ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(value),
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

/// Record one compute pass with a single dispatch.
pub fn dispatch(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    groups: (u32, u32, u32),
) {
    if groups.0 == 0 || groups.1 == 0 || groups.2 == 0 {
        return;
    }
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(label),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, &[]);
    pass.dispatch_workgroups(groups.0, groups.1, groups.2);
}
