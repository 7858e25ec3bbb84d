// orb-gpu: ORB feature extraction (FAST + rotated BRIEF) on wgpu
//
// Host reference kernels live at the crate root; the device versions are
// under `gpu`. `extractor` ties both to a multi-camera pipeline.

pub mod error;
pub mod config;
pub mod image;
pub mod resize;
pub mod gaussian;
pub mod fast;
pub mod distribute;
pub mod pattern;
pub mod orb;
pub mod pyramid;
pub mod extractor;
pub mod cpu;
pub mod gpu;

pub use config::{ExclusionRect, ExtractorConfig};
pub use error::{ExtractorError, Result};
pub use extractor::{CameraFeatures, KeyPoint, OrbExtractor};
pub use image::Image;
