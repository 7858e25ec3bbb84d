// gpu/device.rs — wgpu device context: adapter selection, allocation,
// copies, submission and completion events.
//
// ADAPTER SELECTION
// ─────────────────
// All adapters of the primary backends are enumerated and ranked. For
// `DeviceClass::Default` the ranking is
//
//   DiscreteGpu  >  IntegratedGpu  >  VirtualGpu / Other  >  Cpu
//
// so a software rasterizer (llvmpipe, WARP) is only used when nothing else
// exists. An explicit class (`Cpu`, `IntegratedGpu`, `DiscreteGpu`) accepts
// only adapters of exactly that type and fails with `DeviceUnavailable`
// otherwise.
//
// COMPLETION EVENTS
// ─────────────────
// Every submission returns a `CompletionEvent`: the `SubmissionIndex`
// together with a flag that `Queue::on_submitted_work_done` raises. The
// queue already runs submissions in order, so an event mostly documents a
// producer/consumer edge; the host only blocks on one in `wait` and
// `download`.
//
// With a non-zero poll interval `wait` polls without blocking and sleeps
// between polls instead of parking inside the driver. That keeps a core
// free on machines where the driver spins.
//
// DROP ORDER
// ──────────
// `_instance` is declared last so the `wgpu::Instance` outlives `device`
// and `queue`. Some Vulkan layers (dzn on WSL2) crash when the instance is
// destroyed before device-level objects.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExtractorError, Result};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Which kind of adapter to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Best available: discrete, then integrated, then anything else.
    #[default]
    Default,
    Cpu,
    IntegratedGpu,
    DiscreteGpu,
}

/// Placement hint for an allocation.
///
/// wgpu does not expose memory heaps directly; `Device` and `Shared` both
/// map to storage buffers (the driver picks the heap), `Host` to a
/// host-mappable staging buffer used for readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Device,
    Shared,
    Host,
}

impl MemoryKind {
    fn usages(self) -> wgpu::BufferUsages {
        match self {
            MemoryKind::Device | MemoryKind::Shared => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
            }
            MemoryKind::Host => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        }
    }
}

/// 2D workgroup shape, baked into WGSL via `{{WG_X}}` / `{{WG_Y}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// 16×8 = 128 invocations: four 32-wide warps or two 64-wide waves.
    pub const DEFAULT: WorkgroupSize = WorkgroupSize { x: 16, y: 8 };

    pub fn total(&self) -> u32 {
        self.x * self.y
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Threads per workgroup for one-dimensional kernels (per cell, per keypoint).
pub const WORKGROUP_1D: u32 = 64;

/// Cached adapter information for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl From<wgpu::AdapterInfo> for AdapterInfo {
    fn from(info: wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: info.name,
            vendor: info.vendor,
            device: info.device,
            device_type: info.device_type,
            backend: info.backend,
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Rank of an adapter type for `class`; `None` means not acceptable.
fn adapter_rank(class: DeviceClass, ty: wgpu::DeviceType) -> Option<u32> {
    use wgpu::DeviceType as T;
    match class {
        DeviceClass::Default => Some(match ty {
            T::DiscreteGpu => 0,
            T::IntegratedGpu => 1,
            T::VirtualGpu | T::Other => 2,
            T::Cpu => 3,
        }),
        DeviceClass::Cpu => (ty == T::Cpu).then_some(0),
        DeviceClass::IntegratedGpu => (ty == T::IntegratedGpu).then_some(0),
        DeviceClass::DiscreteGpu => (ty == T::DiscreteGpu).then_some(0),
    }
}

/// Index of the best adapter of `class`, first in enumeration order on ties.
pub fn select_adapter(adapters: &[AdapterInfo], class: DeviceClass) -> Option<usize> {
    adapters
        .iter()
        .enumerate()
        .filter_map(|(i, a)| adapter_rank(class, a.device_type).map(|r| (r, i)))
        .min()
        .map(|(_, i)| i)
}

// ---------------------------------------------------------------------------
// Completion events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Submission {
    index: wgpu::SubmissionIndex,
    done: Arc<AtomicBool>,
}

/// Opaque handle for submitted device work.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    context: u64,
    submissions: Vec<Submission>,
}

impl CompletionEvent {
    /// An event that is already complete.
    pub fn completed(context: u64) -> Self {
        CompletionEvent { context, submissions: Vec::new() }
    }

    pub fn context_id(&self) -> u64 {
        self.context
    }

    pub fn is_complete(&self) -> bool {
        self.submissions.iter().all(|s| s.done.load(Ordering::Acquire))
    }

    /// Combine two events from the same context.
    pub fn merge(&mut self, other: &CompletionEvent) {
        self.submissions.extend(other.submissions.iter().cloned());
    }

    /// Number of submissions tracked.
    pub fn len(&self) -> usize {
        self.submissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Allocations
// ---------------------------------------------------------------------------

/// A device buffer plus the event of the last work that wrote it.
///
/// Clones share the buffer; this is how rect views of one image alias a
/// single allocation.
#[derive(Debug, Clone)]
pub struct DeviceAllocation {
    buffer: Arc<wgpu::Buffer>,
    size: u64,
    kind: MemoryKind,
    context: u64,
    event: CompletionEvent,
}

impl DeviceAllocation {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Event of the last write recorded against this allocation.
    pub fn event(&self) -> &CompletionEvent {
        &self.event
    }

    pub fn set_event(&mut self, event: CompletionEvent) {
        self.event = event;
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }

    /// True if both handles refer to the same device buffer.
    pub fn same_buffer(&self, other: &DeviceAllocation) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

// ---------------------------------------------------------------------------
// DeviceContext
// ---------------------------------------------------------------------------

/// One adapter, device and queue. Owns every allocation made through it.
pub struct DeviceContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    limits: wgpu::Limits,
    id: u64,
    poll_interval: Duration,
    faulted: Arc<AtomicBool>,
    /// Keeps the instance alive until `device` and `queue` are dropped.
    _instance: wgpu::Instance,
}

impl DeviceContext {
    /// Open the best adapter of `class`.
    ///
    /// # Errors
    /// `DeviceUnavailable` if no adapter of the class exists or the device
    /// request fails.
    pub fn new(class: DeviceClass) -> Result<Self> {
        pollster::block_on(Self::init_async(class))
    }

    async fn init_async(class: DeviceClass) -> Result<Self> {
        // Some drivers (dzn on WSL2) declare themselves non-conformant;
        // compute-only use does not depend on the missing features.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        let infos: Vec<AdapterInfo> = adapters.iter().map(|a| a.get_info().into()).collect();
        for info in &infos {
            log::debug!("adapter: {info}");
        }
        let chosen = select_adapter(&infos, class).ok_or_else(|| {
            ExtractorError::DeviceUnavailable(format!(
                "no {class:?} adapter among {} enumerated",
                infos.len()
            ))
        })?;
        let adapter = &adapters[chosen];
        let adapter_info = infos[chosen].clone();
        let limits = adapter.limits();

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("orb-gpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| ExtractorError::DeviceUnavailable(format!("device request failed: {e}")))?;

        let faulted = Arc::new(AtomicBool::new(false));
        let flag = faulted.clone();
        device.on_uncaptured_error(Box::new(move |e| {
            log::error!("uncaptured device error: {e}");
            flag.store(true, Ordering::Release);
        }));

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        log::info!("device context {id}: {adapter_info}");
        Ok(DeviceContext {
            device,
            queue,
            adapter_info,
            workgroup_size: WorkgroupSize::DEFAULT,
            limits,
            id,
            poll_interval: Duration::ZERO,
            faulted,
            _instance: instance,
        })
    }

    /// Host backoff between non-blocking polls in [`wait`](Self::wait).
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &AdapterInfo {
        &self.adapter_info
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// `DeviceUnavailable` once the device reported an uncaptured error.
    pub fn check(&self) -> Result<()> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(ExtractorError::DeviceUnavailable(format!(
                "device {} reported an unrecoverable error",
                self.adapter_info.name
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes (rounded up to 4).
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size; `OutOfMemory` above the device
    /// limits or when the driver reports an out-of-memory error.
    pub fn allocate(&self, size: u64, kind: MemoryKind, label: &str) -> Result<DeviceAllocation> {
        if size == 0 {
            return Err(ExtractorError::InvalidArgument(format!("{label}: zero-sized allocation")));
        }
        let size = align_to(size, wgpu::COPY_BUFFER_ALIGNMENT);
        let cap = match kind {
            MemoryKind::Host => self.limits.max_buffer_size,
            _ => self.limits.max_buffer_size.min(self.limits.max_storage_buffer_binding_size as u64),
        };
        if size > cap {
            return Err(ExtractorError::OutOfMemory(format!(
                "{label}: {size} bytes exceeds the device limit of {cap}"
            )));
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: kind.usages(),
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ExtractorError::OutOfMemory(format!("{label}: {err}")));
        }
        Ok(DeviceAllocation {
            buffer: Arc::new(buffer),
            size,
            kind,
            context: self.id,
            event: CompletionEvent::completed(self.id),
        })
    }

    /// Release an allocation. The buffer is destroyed right away unless a
    /// view still shares it.
    pub fn free(&self, alloc: DeviceAllocation) {
        if let Ok(buffer) = Arc::try_unwrap(alloc.buffer) {
            buffer.destroy();
        }
    }

    fn check_owner(&self, alloc: &DeviceAllocation) -> Result<()> {
        if alloc.context != self.id {
            return Err(ExtractorError::InvalidArgument(format!(
                "allocation belongs to context {}, not {}",
                alloc.context, self.id
            )));
        }
        Ok(())
    }

    fn check_range(alloc: &DeviceAllocation, offset: u64, size: u64, what: &str) -> Result<()> {
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(ExtractorError::InvalidArgument(format!(
                "{what}: offset {offset} and size {size} must be multiples of 4"
            )));
        }
        if offset + size > alloc.size {
            return Err(ExtractorError::InvalidArgument(format!(
                "{what}: range {offset}..{} exceeds allocation of {} bytes",
                offset + size,
                alloc.size
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission and waiting
    // -----------------------------------------------------------------------

    /// Record one command buffer with `record` and submit it after `deps`.
    ///
    /// # Errors
    /// `InvalidArgument` if a dependency belongs to another context; any
    /// error returned by `record` (nothing is submitted then).
    pub fn submit<F>(&self, label: &str, deps: &[&CompletionEvent], record: F) -> Result<CompletionEvent>
    where
        F: FnOnce(&mut wgpu::CommandEncoder) -> Result<()>,
    {
        self.check()?;
        if let Some(d) = deps.iter().find(|d| d.context != self.id) {
            return Err(ExtractorError::InvalidArgument(format!(
                "{label}: dependency from context {} submitted to context {}",
                d.context, self.id
            )));
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        record(&mut encoder)?;
        let index = self.queue.submit(std::iter::once(encoder.finish()));
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
        Ok(CompletionEvent { context: self.id, submissions: vec![Submission { index, done }] })
    }

    /// Block until `event` is complete.
    pub fn wait(&self, event: &CompletionEvent) -> Result<()> {
        if event.context != self.id {
            return Err(ExtractorError::InvalidArgument(format!(
                "waiting on an event of context {} in context {}",
                event.context, self.id
            )));
        }
        if self.poll_interval.is_zero() {
            // In-order queue: the last submission completes last.
            if let Some(last) = event.submissions.last() {
                self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(last.index.clone()));
            }
        } else {
            while !event.is_complete() {
                self.device.poll(wgpu::Maintain::Poll);
                if event.is_complete() {
                    break;
                }
                std::thread::sleep(self.poll_interval);
            }
        }
        self.check()
    }

    // -----------------------------------------------------------------------
    // Copies and fills
    // -----------------------------------------------------------------------

    /// Upload `data` at `offset`. Ordered before every later submission.
    pub fn write(&self, dst: &DeviceAllocation, offset: u64, data: &[u8]) -> Result<CompletionEvent> {
        self.check_owner(dst)?;
        Self::check_range(dst, offset, align_to(data.len() as u64, 4), "write")?;
        if data.len() % 4 == 0 {
            self.queue.write_buffer(&dst.buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(align_to(data.len() as u64, 4) as usize, 0);
            self.queue.write_buffer(&dst.buffer, offset, &padded);
        }
        self.submit("write", &[], |_| Ok(()))
    }

    pub fn memcpy_async(
        &self,
        dst: &DeviceAllocation,
        dst_offset: u64,
        src: &DeviceAllocation,
        src_offset: u64,
        size: u64,
        deps: &[&CompletionEvent],
    ) -> Result<CompletionEvent> {
        self.check_owner(dst)?;
        self.check_owner(src)?;
        Self::check_range(dst, dst_offset, size, "memcpy dst")?;
        Self::check_range(src, src_offset, size, "memcpy src")?;
        if dst.same_buffer(src) {
            return Err(ExtractorError::InvalidArgument("memcpy within one buffer".into()));
        }
        self.submit("memcpy", deps, |enc| {
            enc.copy_buffer_to_buffer(&src.buffer, src_offset, &dst.buffer, dst_offset, size);
            Ok(())
        })
    }

    pub fn memcpy(
        &self,
        dst: &DeviceAllocation,
        dst_offset: u64,
        src: &DeviceAllocation,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let ev = self.memcpy_async(dst, dst_offset, src, src_offset, size, &[])?;
        self.wait(&ev)
    }

    /// Set `size` bytes at `offset` to `value`.
    pub fn memset_async(
        &self,
        dst: &DeviceAllocation,
        offset: u64,
        size: u64,
        value: u8,
        deps: &[&CompletionEvent],
    ) -> Result<CompletionEvent> {
        self.fill_async(dst, offset, size, u32::from_ne_bytes([value; 4]), deps)
    }

    pub fn memset(&self, dst: &DeviceAllocation, offset: u64, size: u64, value: u8) -> Result<()> {
        let ev = self.memset_async(dst, offset, size, value, &[])?;
        self.wait(&ev)
    }

    /// Fill `size` bytes at `offset` with the 32-bit `pattern`.
    pub fn fill_async(
        &self,
        dst: &DeviceAllocation,
        offset: u64,
        size: u64,
        pattern: u32,
        deps: &[&CompletionEvent],
    ) -> Result<CompletionEvent> {
        self.check_owner(dst)?;
        Self::check_range(dst, offset, size, "fill")?;
        if pattern != 0 {
            let words = vec![pattern; (size / 4) as usize];
            self.queue.write_buffer(&dst.buffer, offset, bytemuck::cast_slice(&words));
        }
        self.submit("fill", deps, |enc| {
            if pattern == 0 {
                enc.clear_buffer(&dst.buffer, offset, Some(size));
            }
            Ok(())
        })
    }

    pub fn fill(&self, dst: &DeviceAllocation, offset: u64, size: u64, pattern: u32) -> Result<()> {
        let ev = self.fill_async(dst, offset, size, pattern, &[])?;
        self.wait(&ev)
    }

    /// Copy `size` bytes at `offset` back to the host. Blocks.
    pub fn download(&self, src: &DeviceAllocation, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.check_owner(src)?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let aligned = align_to(size, 4);
        Self::check_range(src, offset, aligned, "download")?;
        let staging = self.allocate(aligned, MemoryKind::Host, "download staging")?;
        let ev = self.submit("download", &[src.event()], |enc| {
            enc.copy_buffer_to_buffer(&src.buffer, offset, &staging.buffer, 0, aligned);
            Ok(())
        })?;

        let slice = staging.buffer.slice(..aligned);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.wait(&ev)?;
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| ExtractorError::DeviceUnavailable("readback callback dropped".into()))?
            .map_err(|e| ExtractorError::DeviceUnavailable(format!("readback map failed: {e}")))?;
        let bytes = slice.get_mapped_range()[..size as usize].to_vec();
        staging.buffer.unmap();
        self.free(staging);
        Ok(bytes)
    }

    // -----------------------------------------------------------------------
    // Dispatch helpers
    // -----------------------------------------------------------------------

    /// Workgroups covering a `w × h` grid with the 2D workgroup size.
    ///
    /// Ceiling division: shaders guard `gid.x >= w || gid.y >= h`.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        dispatch_2d(self.workgroup_size, w, h)
    }

    /// Workgroups covering `n` items with [`WORKGROUP_1D`] threads each.
    pub fn dispatch_1d(&self, n: u32) -> u32 {
        n.div_ceil(WORKGROUP_1D)
    }
}

fn dispatch_2d(wg: WorkgroupSize, w: u32, h: u32) -> (u32, u32) {
    (w.div_ceil(wg.x), h.div_ceil(wg.y))
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceContext {{ id: {}, adapter: {}, workgroup: {} }}",
            self.id, self.adapter_info, self.workgroup_size
        )
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn info(name: &str, device_type: wgpu::DeviceType) -> AdapterInfo {
        AdapterInfo {
            name: name.into(),
            vendor: 0,
            device: 0,
            device_type,
            backend: wgpu::Backend::Vulkan,
        }
    }

    #[test]
    fn test_default_prefers_discrete() {
        use wgpu::DeviceType as T;
        let list = [info("llvmpipe", T::Cpu), info("igpu", T::IntegratedGpu), info("dgpu", T::DiscreteGpu)];
        assert_eq!(select_adapter(&list, DeviceClass::Default), Some(2));
        assert_eq!(select_adapter(&list[..2], DeviceClass::Default), Some(1));
        assert_eq!(select_adapter(&list[..1], DeviceClass::Default), Some(0));
        assert_eq!(select_adapter(&[], DeviceClass::Default), None);
    }

    #[test]
    fn test_explicit_class_is_exact() {
        use wgpu::DeviceType as T;
        let list = [info("dzn", T::Other), info("igpu", T::IntegratedGpu)];
        assert_eq!(select_adapter(&list, DeviceClass::IntegratedGpu), Some(1));
        assert_eq!(select_adapter(&list, DeviceClass::DiscreteGpu), None);
        assert_eq!(select_adapter(&list, DeviceClass::Cpu), None);
        assert_eq!(select_adapter(&list, DeviceClass::Default), Some(1));
    }

    #[test]
    fn test_dispatch_size_ceiling() {
        let wg = WorkgroupSize::DEFAULT;
        assert_eq!(dispatch_2d(wg, 640, 480), (40, 60));
        assert_eq!(dispatch_2d(wg, 100, 100), (7, 13));
        assert_eq!(dispatch_2d(WorkgroupSize { x: 8, y: 8 }, 752, 480), (94, 60));
    }

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 4), 0);
        assert_eq!(align_to(1, 4), 4);
        assert_eq!(align_to(640, 4), 640);
        assert_eq!(align_to(533, 4), 536);
    }

    #[test]
    fn test_completed_event() {
        let ev = CompletionEvent::completed(7);
        assert!(ev.is_complete());
        assert!(ev.is_empty());
        assert_eq!(ev.context_id(), 7);
    }

    // ---- GPU integration tests (subprocess isolation) -------------------------
    //
    // Each real GPU test runs in a child `cargo test` process and prints
    // "GPU_TEST_OK" when its assertions pass. The parent only checks for the
    // marker, so a driver that crashes during process exit (dzn on WSL2)
    // does not fail the suite.

    pub(crate) fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_context_init() {
        let ctx = DeviceContext::new(DeviceClass::Default).expect("should open a device");
        println!("{ctx}");
        assert!(ctx.check().is_ok());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_allocate_fill_download() {
        let ctx = DeviceContext::new(DeviceClass::Default).unwrap();
        assert!(matches!(
            ctx.allocate(0, MemoryKind::Device, "zero"),
            Err(ExtractorError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.allocate(u64::MAX / 2, MemoryKind::Device, "huge"),
            Err(ExtractorError::OutOfMemory(_))
        ));

        let a = ctx.allocate(64, MemoryKind::Device, "a").unwrap();
        let b = ctx.allocate(64, MemoryKind::Shared, "b").unwrap();
        ctx.memset(&a, 0, 64, 0xab).unwrap();
        ctx.fill(&a, 16, 16, 0x0403_0201).unwrap();
        ctx.memcpy(&b, 0, &a, 0, 64).unwrap();
        let bytes = ctx.download(&b, 0, 64).unwrap();
        assert!(bytes[..16].iter().all(|&v| v == 0xab));
        assert_eq!(&bytes[16..20], &0x0403_0201u32.to_ne_bytes());
        assert!(bytes[32..].iter().all(|&v| v == 0xab));
        ctx.free(a);
        ctx.free(b);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_events_and_backoff() {
        let mut ctx = DeviceContext::new(DeviceClass::Default).unwrap();
        ctx.set_poll_interval(Duration::from_micros(50));
        let a = ctx.allocate(1 << 20, MemoryKind::Device, "a").unwrap();
        let e1 = ctx.memset_async(&a, 0, 1 << 20, 7, &[]).unwrap();
        let e2 = ctx.memset_async(&a, 0, 4, 9, &[&e1]).unwrap();
        ctx.wait(&e2).unwrap();
        assert!(e2.is_complete());
        assert_eq!(ctx.download(&a, 0, 8).unwrap(), vec![9, 9, 9, 9, 7, 7, 7, 7]);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_foreign_event_rejected() {
        let a = DeviceContext::new(DeviceClass::Default).unwrap();
        let b = DeviceContext::new(DeviceClass::Default).unwrap();
        let ev = a.submit("noop", &[], |_| Ok(())).unwrap();
        assert!(matches!(b.submit("x", &[&ev], |_| Ok(())), Err(ExtractorError::InvalidArgument(_))));
        assert!(b.wait(&ev).is_err());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_context_init() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_context_init");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_allocate_fill_download() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_allocate_fill_download");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_events_and_backoff() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_events_and_backoff");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_foreign_event_rejected() {
        let out = run_gpu_test_in_subprocess("gpu::device::tests::inner_foreign_event_rejected");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
