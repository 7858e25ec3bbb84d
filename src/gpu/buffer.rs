// gpu/buffer.rs — typed device arrays and 8-bit device images.
//
// DEVICE IMAGE LAYOUT
// ───────────────────
// WGSL has no 8-bit storage type, so an 8-bit image lives in a storage
// buffer of `u32` words with four pixels per word, little-endian:
//
//   byte address  a = origin + y * elem_step + x
//   pixel         (buf[a >> 2] >> ((a & 3) * 8)) & 0xff
//
// `elem_step` (row stride in bytes) is always a multiple of 4, so a view
// whose origin is word-aligned starts every row on a word boundary. Kernels
// that *write* an image give each thread one destination word and require a
// word-aligned destination view; bytes of the word outside the view are
// preserved (read-modify-write). Reads may start anywhere.
//
// VIEWS
// ─────
// `view(rect)` returns a handle to a sub-rectangle sharing the backing
// allocation. The pyramid stacks its levels vertically in one allocation
// and hands out one view per level.

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::error::{ExtractorError, Result};
use crate::gpu::device::{align_to, CompletionEvent, DeviceAllocation, DeviceContext, MemoryKind};
use crate::image::{Image, Rect};

/// A flat array of `T` in device memory.
///
/// An empty array still owns one zeroed element: wgpu cannot bind a
/// zero-sized buffer. `len()` reports the logical length.
#[derive(Debug, Clone)]
pub struct DeviceArray<T: Pod> {
    alloc: DeviceAllocation,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceArray<T> {
    /// Uninitialized array of `len` elements.
    pub fn new(ctx: &DeviceContext, len: usize, label: &str) -> Result<Self> {
        let bytes = (len.max(1) * std::mem::size_of::<T>()) as u64;
        let alloc = ctx.allocate(bytes, MemoryKind::Device, label)?;
        Ok(DeviceArray { alloc, len, _marker: PhantomData })
    }

    /// Array initialized from `data`.
    pub fn from_slice(ctx: &DeviceContext, data: &[T], label: &str) -> Result<Self> {
        let mut arr = Self::new(ctx, data.len(), label)?;
        if !data.is_empty() {
            arr.write(ctx, data)?;
        }
        Ok(arr)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the logical contents in bytes.
    pub fn byte_len(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }

    pub fn alloc(&self) -> &DeviceAllocation {
        &self.alloc
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        self.alloc.buffer()
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.alloc.binding()
    }

    pub fn event(&self) -> &CompletionEvent {
        self.alloc.event()
    }

    pub fn set_event(&mut self, event: CompletionEvent) {
        self.alloc.set_event(event);
    }

    /// Overwrite the first `data.len()` elements.
    pub fn write(&mut self, ctx: &DeviceContext, data: &[T]) -> Result<()> {
        if data.len() > self.len {
            return Err(ExtractorError::InvalidArgument(format!(
                "writing {} elements into an array of {}",
                data.len(),
                self.len
            )));
        }
        let ev = ctx.write(&self.alloc, 0, bytemuck::cast_slice(data))?;
        self.alloc.set_event(ev);
        Ok(())
    }

    /// Read `n` elements starting at `start` (blocking). The range is
    /// clipped to the array.
    pub fn read_range(&self, ctx: &DeviceContext, start: usize, n: usize) -> Result<Vec<T>> {
        let n = n.min(self.len.saturating_sub(start));
        if n == 0 {
            return Ok(Vec::new());
        }
        let size = std::mem::size_of::<T>();
        let bytes = ctx.download(&self.alloc, (start * size) as u64, (n * size) as u64)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Read the first `n` elements back (blocking).
    pub fn read_prefix(&self, ctx: &DeviceContext, n: usize) -> Result<Vec<T>> {
        self.read_range(ctx, 0, n)
    }

    /// Read the whole array back (blocking).
    pub fn read(&self, ctx: &DeviceContext) -> Result<Vec<T>> {
        self.read_prefix(ctx, self.len)
    }
}

/// Image geometry as the kernels see it, all in bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ImageDesc {
    pub origin: u32,
    pub step: u32,
    pub cols: u32,
    pub rows: u32,
}

impl ImageDesc {
    /// Destination words per row for a word-aligned view.
    pub fn words_per_row(&self) -> u32 {
        self.cols.div_ceil(4)
    }
}

/// An 8-bit image in device memory, or a rectangular view of one.
#[derive(Debug, Clone)]
pub struct DeviceImage {
    alloc: DeviceAllocation,
    /// Backing width in pixels.
    pub cols: usize,
    /// Backing height in pixels.
    pub rows: usize,
    /// Row stride in bytes, a multiple of 4.
    pub elem_step: usize,
    /// Region this handle refers to, in backing coordinates.
    pub rect: Rect,
}

impl DeviceImage {
    /// Allocate a `cols × rows` image.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero dimension, `OutOfMemory` if the
    /// allocation fails.
    pub fn new(ctx: &DeviceContext, cols: usize, rows: usize, label: &str) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(ExtractorError::InvalidArgument(format!(
                "{label}: device image must be non-empty (got {cols}x{rows})"
            )));
        }
        let elem_step = align_to(cols as u64, 4) as usize;
        let alloc = ctx.allocate((elem_step * rows) as u64, MemoryKind::Device, label)?;
        Ok(DeviceImage { alloc, cols, rows, elem_step, rect: Rect::new(0, 0, cols, rows) })
    }

    /// Allocate and upload a host image.
    pub fn from_image(ctx: &DeviceContext, img: &Image<u8>, label: &str) -> Result<Self> {
        let mut dev = Self::new(ctx, img.width(), img.height(), label)?;
        dev.upload(ctx, img)?;
        Ok(dev)
    }

    /// A view of `rect`, given relative to this handle's region.
    pub fn view(&self, rect: Rect) -> Result<DeviceImage> {
        let local = Rect::new(0, 0, self.rect.width, self.rect.height);
        if rect.is_empty() || !local.contains_rect(&rect) {
            return Err(ExtractorError::InvalidArgument(format!(
                "view {rect:?} outside {}x{} image",
                self.rect.width, self.rect.height
            )));
        }
        Ok(DeviceImage {
            rect: Rect::new(self.rect.x + rect.x, self.rect.y + rect.y, rect.width, rect.height),
            ..self.clone()
        })
    }

    pub fn width(&self) -> usize {
        self.rect.width
    }

    pub fn height(&self) -> usize {
        self.rect.height
    }

    /// Byte address of the view's top-left pixel.
    pub fn origin(&self) -> usize {
        self.rect.y * self.elem_step + self.rect.x
    }

    pub fn desc(&self) -> ImageDesc {
        ImageDesc {
            origin: self.origin() as u32,
            step: self.elem_step as u32,
            cols: self.rect.width as u32,
            rows: self.rect.height as u32,
        }
    }

    pub fn alloc(&self) -> &DeviceAllocation {
        &self.alloc
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        self.alloc.buffer()
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.alloc.binding()
    }

    pub fn event(&self) -> &CompletionEvent {
        self.alloc.event()
    }

    pub fn set_event(&mut self, event: CompletionEvent) {
        self.alloc.set_event(event);
    }

    /// True if both handles share one backing allocation.
    pub fn aliases(&self, other: &DeviceImage) -> bool {
        self.alloc.same_buffer(&other.alloc)
    }

    /// `InvalidArgument` unless the view can be a kernel destination.
    pub fn check_writable(&self) -> Result<()> {
        if self.origin() % 4 != 0 {
            return Err(ExtractorError::InvalidArgument(format!(
                "destination view {:?} does not start on a 4-byte boundary",
                self.rect
            )));
        }
        Ok(())
    }

    /// Upload a host image into this view. Only views that span whole
    /// rows from column 0 can be uploaded; row bytes past the view width
    /// are zeroed.
    pub fn upload(&mut self, ctx: &DeviceContext, img: &Image<u8>) -> Result<()> {
        if (img.width(), img.height()) != (self.width(), self.height()) {
            return Err(ExtractorError::SizeMismatch(format!(
                "uploading {}x{} into a {}x{} view",
                img.width(),
                img.height(),
                self.width(),
                self.height()
            )));
        }
        if self.rect.x != 0 {
            return Err(ExtractorError::InvalidArgument(format!(
                "upload target {:?} must start at column 0",
                self.rect
            )));
        }
        let step = self.elem_step;
        let mut staging = vec![0u8; step * self.height()];
        for y in 0..self.height() {
            staging[y * step..y * step + self.width()].copy_from_slice(img.row(y));
        }
        let ev = ctx.write(&self.alloc, (self.rect.y * step) as u64, &staging)?;
        self.alloc.set_event(ev);
        Ok(())
    }

    /// Copy the view back into a host image (blocking).
    pub fn download(&self, ctx: &DeviceContext) -> Result<Image<u8>> {
        let step = self.elem_step;
        let bytes = ctx.download(
            &self.alloc,
            (self.rect.y * step) as u64,
            (self.height() * step) as u64,
        )?;
        let mut out = Image::new(self.width(), self.height());
        for y in 0..self.height() {
            let start = y * step + self.rect.x;
            out.row_mut(y).copy_from_slice(&bytes[start..start + self.width()]);
        }
        Ok(out)
    }
}
