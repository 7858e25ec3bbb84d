// gpu/mod.rs — wgpu compute layer.
//
// Every kernel here mirrors a host reference in the parent crate and is
// validated against it: resize, blur and FAST bit-exactly, orientation and
// descriptors within a small tolerance.
//
//   device    adapter selection, allocation, copies, submission, events
//   buffer    typed arrays and packed 8-bit images with rect views
//   kernels   WGSL loading, templating and pipeline helpers
//   resize / gaussian / fast / orb   one wrapper per shader
//   backend   the per-camera frames driving all of the above
//
// The host only blocks twice per extract() call: after detection, to read
// corners back for the quad-tree, and after description.

pub mod backend;
pub mod buffer;
pub mod device;
pub mod fast;
pub mod gaussian;
pub mod kernels;
pub mod orb;
pub mod resize;
