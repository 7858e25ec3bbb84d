// config.rs — extractor configuration.
//
// Every tunable lives in one serde-friendly struct so a host application
// can keep it in a TOML file next to its camera calibration:
//
//   max_num_keypoints  = 2000
//   scale_factor       = 1.2
//   num_levels         = 8
//   ini_fast_threshold = 20
//   min_fast_threshold = 7
//   num_cameras        = 2
//
//   [fast]
//   nms = true
//   retry = "whole_image"
//
//   [blur]
//   border = "reflect101"
//
// Missing keys fall back to `Default` (`#[serde(default)]`), so a file
// only needs to spell out what differs. `validate()` is the single place
// argument rules are enforced; the extractor calls it at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ExtractorError, Result};
use crate::fast::RetryPolicy;
use crate::gaussian::BorderType;
use crate::gpu::device::DeviceClass;

/// Environment variable that overrides [`ExtractorConfig::poll_interval_us`].
pub const POLL_INTERVAL_ENV: &str = "ORB_GPU_POLL_INTERVAL_US";

/// Largest Gaussian kernel the blur kernels accept.
pub const MAX_BLUR_KERNEL: usize = 15;

/// An exclusion rectangle in normalized image coordinates.
///
/// All four values are fractions of the full-resolution image in `[0, 1]`,
/// so the same rectangle applies to every pyramid level. Keypoints with
/// `xmin <= x < xmax && ymin <= y < ymax` are discarded at detection time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExclusionRect {
    pub xmin: f32,
    pub xmax: f32,
    pub ymin: f32,
    pub ymax: f32,
}

impl ExclusionRect {
    pub fn new(xmin: f32, xmax: f32, ymin: f32, ymax: f32) -> Self {
        ExclusionRect { xmin, xmax, ymin, ymax }
    }

    /// The rectangle in full-resolution pixels: `[xmin, xmax, ymin, ymax]`.
    pub fn to_pixels(&self, cols: usize, rows: usize) -> [f32; 4] {
        [
            self.xmin * cols as f32,
            self.xmax * cols as f32,
            self.ymin * rows as f32,
            self.ymax * rows as f32,
        ]
    }

    fn validate(&self) -> Result<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if ![self.xmin, self.xmax, self.ymin, self.ymax].iter().all(|&v| in_unit(v))
            || self.xmin > self.xmax
            || self.ymin > self.ymax
        {
            return Err(ExtractorError::InvalidArgument(format!(
                "exclusion rect {self:?} must satisfy 0 <= min <= max <= 1"
            )));
        }
        Ok(())
    }
}

/// True when the full-resolution point `(fx, fy)` lies in any of the
/// pixel-space rectangles produced by [`ExclusionRect::to_pixels`].
#[inline]
pub fn excluded(rects: &[[f32; 4]], fx: f32, fy: f32) -> bool {
    rects
        .iter()
        .any(|r| fx >= r[0] && fx < r[1] && fy >= r[2] && fy < r[3])
}

/// Grid FAST parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastConfig {
    /// Pixels excluded along every image edge. Must leave room for the
    /// 31-pixel descriptor patch, hence the default of 19.
    pub edge_clip: usize,
    /// Cell side length in pixels.
    pub cell_size: usize,
    /// Extra pixels each cell reaches into its right/bottom neighbour.
    pub overlap: usize,
    /// Non-maximum suppression over the 8-neighbourhood.
    pub nms: bool,
    /// Granularity of the fallback to `min_fast_threshold`.
    pub retry: RetryPolicy,
    /// Upper bound on raw corners collected per level on the device.
    pub max_raw_keypoints: usize,
}

impl Default for FastConfig {
    fn default() -> Self {
        FastConfig {
            edge_clip: 19,
            cell_size: 32,
            overlap: 6,
            nms: true,
            retry: RetryPolicy::WholeImage,
            max_raw_keypoints: 1 << 16,
        }
    }
}

/// Gaussian blur parameters applied before descriptor sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    pub kernel_size: usize,
    pub sigma: f64,
    pub border: BorderType,
}

impl Default for BlurConfig {
    fn default() -> Self {
        BlurConfig {
            kernel_size: 7,
            sigma: 2.0,
            border: BorderType::Reflect101,
        }
    }
}

/// Full extractor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Keypoint budget per camera, summed over all levels.
    pub max_num_keypoints: usize,
    /// Ratio between consecutive pyramid levels. Must exceed 1.
    pub scale_factor: f32,
    pub num_levels: usize,
    pub ini_fast_threshold: u8,
    pub min_fast_threshold: u8,
    pub num_cameras: usize,
    /// One list per camera; empty means no exclusion anywhere.
    pub exclusion_rects: Vec<Vec<ExclusionRect>>,
    pub fast: FastConfig,
    pub blur: BlurConfig,
    pub device: DeviceClass,
    /// Directory holding `.wgsl` kernel sources that replace the built-in ones.
    pub kernel_path: Option<PathBuf>,
    /// Host sleep between non-blocking device polls. 0 blocks in the driver.
    pub poll_interval_us: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig {
            max_num_keypoints: 2000,
            scale_factor: 1.2,
            num_levels: 8,
            ini_fast_threshold: 20,
            min_fast_threshold: 7,
            num_cameras: 1,
            exclusion_rects: Vec::new(),
            fast: FastConfig::default(),
            blur: BlurConfig::default(),
            device: DeviceClass::Default,
            kernel_path: None,
            poll_interval_us: 0,
        }
    }
}

impl ExtractorConfig {
    /// Configuration matching the common ORB-SLAM front-end setup.
    pub fn new(
        max_num_keypoints: usize,
        scale_factor: f32,
        num_levels: usize,
        ini_fast_threshold: u8,
        min_fast_threshold: u8,
        num_cameras: usize,
    ) -> Self {
        ExtractorConfig {
            max_num_keypoints,
            scale_factor,
            num_levels,
            ini_fast_threshold,
            min_fast_threshold,
            num_cameras,
            ..Default::default()
        }
    }

    pub fn with_exclusion_rects(mut self, rects: Vec<Vec<ExclusionRect>>) -> Self {
        self.exclusion_rects = rects;
        self
    }

    pub fn set_gpu_kernel_path<P: AsRef<Path>>(&mut self, path: P) {
        self.kernel_path = Some(path.as_ref().to_path_buf());
    }

    /// Exclusion rectangles of one camera (empty when none configured).
    pub fn exclusion_rects_for(&self, camera: usize) -> &[ExclusionRect] {
        self.exclusion_rects.get(camera).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Effective host poll interval, honouring [`POLL_INTERVAL_ENV`].
    pub fn poll_interval(&self) -> Duration {
        let us = match std::env::var(POLL_INTERVAL_ENV) {
            Ok(v) => v.trim().parse::<u64>().unwrap_or_else(|_| {
                log::warn!("ignoring {POLL_INTERVAL_ENV}={v:?}: not an integer");
                self.poll_interval_us
            }),
            Err(_) => self.poll_interval_us,
        };
        Duration::from_micros(us)
    }

    /// Check every argument rule. Called by the extractor constructor.
    pub fn validate(&self) -> Result<()> {
        let invalid = |m: String| Err(ExtractorError::InvalidArgument(m));

        if self.max_num_keypoints == 0 {
            return invalid("max_num_keypoints must be positive".into());
        }
        if !(self.scale_factor.is_finite() && self.scale_factor > 1.0) {
            return invalid(format!("scale_factor must be > 1.0 (got {})", self.scale_factor));
        }
        if self.num_levels == 0 || self.num_levels > 32 {
            return invalid(format!("num_levels must be in 1..=32 (got {})", self.num_levels));
        }
        if self.min_fast_threshold == 0 || self.min_fast_threshold > self.ini_fast_threshold {
            return invalid(format!(
                "thresholds must satisfy 1 <= min ({}) <= ini ({})",
                self.min_fast_threshold, self.ini_fast_threshold
            ));
        }
        if self.num_cameras == 0 {
            return invalid("num_cameras must be at least 1".into());
        }
        if !self.exclusion_rects.is_empty() && self.exclusion_rects.len() != self.num_cameras {
            return Err(ExtractorError::SizeMismatch(format!(
                "{} exclusion rect lists for {} cameras",
                self.exclusion_rects.len(),
                self.num_cameras
            )));
        }
        for rect in self.exclusion_rects.iter().flatten() {
            rect.validate()?;
        }

        let f = &self.fast;
        if f.cell_size == 0 || f.overlap >= f.cell_size {
            return invalid(format!(
                "cell_size ({}) must be positive and exceed overlap ({})",
                f.cell_size, f.overlap
            ));
        }
        if f.edge_clip < 3 {
            return invalid(format!("edge_clip must be >= 3 (got {})", f.edge_clip));
        }
        if f.max_raw_keypoints == 0 {
            return invalid("max_raw_keypoints must be positive".into());
        }

        let b = &self.blur;
        if b.kernel_size % 2 == 0 || b.kernel_size > MAX_BLUR_KERNEL {
            return invalid(format!(
                "blur kernel size must be odd and <= {MAX_BLUR_KERNEL} (got {})",
                b.kernel_size
            ));
        }
        if !(b.sigma.is_finite() && b.sigma > 0.0) {
            return invalid(format!("blur sigma must be positive (got {})", b.sigma));
        }
        Ok(())
    }

    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::read_toml(path.as_ref())?)
    }

    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Ok(self.write_toml(path.as_ref())?)
    }

    fn read_toml(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn write_toml(&self, path: &Path) -> std::result::Result<(), ConfigError> {
        let content = toml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
