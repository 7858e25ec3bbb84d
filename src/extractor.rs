// extractor.rs — multi-camera ORB extraction front door.
//
// PIPELINE
// ────────
//   validate ─► detect (all cameras, all levels) ─► wait + download corners
//            ─► distribute per level (host quad-tree)
//            ─► describe (all cameras, all levels) ─► wait + download
//            ─► rescale to full resolution, concatenate levels
//
// The two device phases live behind `Backend`, so the same orchestration
// runs on the GPU and on the host reference kernels. A backend queues all
// cameras in `submit_*` and blocks once in `finish_*`.
//
// A `DeviceUnavailable` error poisons the extractor: every later call
// fails fast and the caller is expected to build a new one. A kernel
// reload that fails only poisons it when the device itself is gone; the
// previous kernels stay in use otherwise.

use std::path::Path;

use crate::config::ExtractorConfig;
use crate::cpu::CpuBackend;
use crate::distribute::{distribute, Bounds};
use crate::error::{ExtractorError, Result};
use crate::fast::Corner;
use crate::gpu::backend::GpuBackend;
use crate::image::Image;
use crate::orb::{Descriptor, DESCRIPTOR_BYTES, PATCH_SIZE};
use crate::pyramid::PyramidLayout;

/// A detected and described keypoint, in full-resolution pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    pub response: f32,
    /// Orientation in degrees, `[0, 360)`; -1 when unset.
    pub angle: f32,
    /// Pyramid level the keypoint was found on.
    pub octave: u32,
    /// Patch diameter in full-resolution pixels.
    pub size: f32,
}

/// Output of one camera. `descriptors[i]` belongs to `keypoints[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraFeatures {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl CameraFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Descriptors as a contiguous `len() × 32` byte matrix.
    pub fn descriptor_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.descriptors)
    }

    /// Row stride of [`descriptor_bytes`](Self::descriptor_bytes).
    pub const fn descriptor_stride() -> usize {
        DESCRIPTOR_BYTES
    }
}

/// Everything a backend needs to process one camera.
#[derive(Debug, Clone)]
pub struct CameraInput<'a> {
    pub image: &'a Image<u8>,
    pub mask: Option<&'a Image<u8>>,
    /// Exclusion rectangles in full-resolution pixels.
    pub rects: Vec<[f32; 4]>,
    pub layout: PyramidLayout,
}

/// Raw corners of one camera, indexed by level.
pub type LevelCorners = Vec<Vec<Corner>>;

/// Angles and descriptors of one camera, indexed by level.
pub type LevelDescriptions = Vec<(Vec<f32>, Vec<Descriptor>)>;

/// Execution engine for the two extraction phases.
pub trait Backend {
    fn name(&self) -> &str;

    /// Queue pyramid construction, blurring and FAST for every camera.
    fn submit_detect(&mut self, inputs: &[CameraInput<'_>]) -> Result<()>;

    /// Wait for detection and return raw corners, sorted row-major.
    fn finish_detect(&mut self) -> Result<Vec<LevelCorners>>;

    /// Queue orientation and descriptor computation for the kept corners.
    fn submit_describe(&mut self, corners: &[LevelCorners]) -> Result<()>;

    fn finish_describe(&mut self) -> Result<Vec<LevelDescriptions>>;

    /// Replace the kernel sources with the `.wgsl` files in `dir`. On
    /// error the previously loaded kernels must remain usable.
    fn reload_kernels(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    /// `DeviceUnavailable` once the execution device is lost.
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// ORB feature extractor over `num_cameras` images per call.
pub struct OrbExtractor<B: Backend = GpuBackend> {
    config: ExtractorConfig,
    backend: B,
    poisoned: bool,
}

impl OrbExtractor<GpuBackend> {
    /// Validate `config` and open a device of `config.device`.
    ///
    /// # Errors
    /// `InvalidArgument`/`SizeMismatch` for a bad configuration,
    /// `DeviceUnavailable` when no adapter matches or a kernel fails to load.
    pub fn new(config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        let backend = GpuBackend::new(&config)?;
        Ok(Self::from_parts(config, backend))
    }
}

impl OrbExtractor<CpuBackend> {
    /// Extractor running the host reference kernels.
    pub fn cpu(config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        let backend = CpuBackend::new(&config)?;
        Ok(Self::from_parts(config, backend))
    }
}

impl<B: Backend> OrbExtractor<B> {
    pub fn with_backend(config: ExtractorConfig, backend: B) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, backend))
    }

    fn from_parts(config: ExtractorConfig, backend: B) -> Self {
        log::info!(
            "OrbExtractor on {}: {} camera(s), {} levels x{}, {} keypoints",
            backend.name(),
            config.num_cameras,
            config.num_levels,
            config.scale_factor,
            config.max_num_keypoints
        );
        OrbExtractor { config, backend, poisoned: false }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Load kernel sources from `path` instead of the built-in copies.
    ///
    /// # Errors
    /// `DeviceUnavailable` if a file is missing or fails to compile. The
    /// extractor keeps its current kernels and configuration.
    pub fn set_gpu_kernel_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Err(e) = self.backend.reload_kernels(path) {
            let health = self.backend.check();
            self.note(&health);
            return Err(e);
        }
        self.config.set_gpu_kernel_path(path);
        Ok(())
    }

    /// Extract keypoints and descriptors from one image per camera.
    ///
    /// `masks` is either empty or holds one mask per camera, each the size
    /// of its image; zero mask pixels never yield keypoints.
    pub fn extract(&mut self, images: &[Image<u8>], masks: &[Image<u8>]) -> Result<Vec<CameraFeatures>> {
        if self.poisoned {
            return Err(ExtractorError::DeviceUnavailable(
                "extractor is unusable after an earlier device failure".into(),
            ));
        }
        let inputs = self.prepare(images, masks)?;
        let result = self.run(&inputs);
        self.note(&result);
        result
    }

    fn note<T>(&mut self, result: &Result<T>) {
        if let Err(e) = result {
            if e.is_fatal() {
                log::warn!("{}: {e}; extractor poisoned", self.backend.name());
                self.poisoned = true;
            }
        }
    }

    /// Argument checks, done before any device work.
    fn prepare<'a>(&self, images: &'a [Image<u8>], masks: &'a [Image<u8>]) -> Result<Vec<CameraInput<'a>>> {
        let cfg = &self.config;
        if images.len() != cfg.num_cameras {
            return Err(ExtractorError::SizeMismatch(format!(
                "{} images for {} cameras",
                images.len(),
                cfg.num_cameras
            )));
        }
        if !masks.is_empty() && masks.len() != cfg.num_cameras {
            return Err(ExtractorError::SizeMismatch(format!(
                "{} masks for {} cameras",
                masks.len(),
                cfg.num_cameras
            )));
        }
        images
            .iter()
            .enumerate()
            .map(|(cam, image)| {
                let (cols, rows) = (image.width(), image.height());
                if cols == 0 || rows == 0 {
                    return Err(ExtractorError::InvalidArgument(format!("empty {cols}x{rows} image"))
                        .for_camera(cam));
                }
                let mask = masks.get(cam);
                if let Some(m) = mask {
                    if (m.width(), m.height()) != (cols, rows) {
                        return Err(ExtractorError::SizeMismatch(format!(
                            "mask is {}x{}, image is {cols}x{rows}",
                            m.width(),
                            m.height()
                        ))
                        .for_camera(cam));
                    }
                }
                let layout = PyramidLayout::new(
                    cols,
                    rows,
                    cfg.scale_factor,
                    cfg.num_levels,
                    cfg.max_num_keypoints,
                )
                .map_err(|e| e.for_camera(cam))?;
                let rects = cfg
                    .exclusion_rects_for(cam)
                    .iter()
                    .map(|r| r.to_pixels(cols, rows))
                    .collect();
                Ok(CameraInput { image, mask, rects, layout })
            })
            .collect()
    }

    fn run(&mut self, inputs: &[CameraInput<'_>]) -> Result<Vec<CameraFeatures>> {
        self.backend.submit_detect(inputs)?;
        let raw = self.backend.finish_detect()?;

        let edge = self.config.fast.edge_clip as f32;
        let kept: Vec<LevelCorners> = inputs
            .iter()
            .zip(&raw)
            .map(|(input, levels)| {
                input
                    .layout
                    .levels
                    .iter()
                    .zip(levels)
                    .map(|(info, corners)| {
                        let area = Bounds::new(edge, edge, info.cols as f32 - edge, info.rows as f32 - edge);
                        distribute(corners, area, info.budget)
                    })
                    .collect()
            })
            .collect();

        self.backend.submit_describe(&kept)?;
        let described = self.backend.finish_describe()?;

        let mut out = Vec::with_capacity(inputs.len());
        for (cam, ((input, levels), descs)) in inputs.iter().zip(&kept).zip(described).enumerate() {
            let features = assemble(&input.layout, levels, descs);
            log::debug!(
                "camera {cam}: {} raw -> {} keypoints over {} levels",
                raw[cam].iter().map(Vec::len).sum::<usize>(),
                features.len(),
                input.layout.num_levels()
            );
            out.push(features);
        }
        Ok(out)
    }
}

/// Rescale level corners to full resolution and concatenate the levels.
fn assemble(layout: &PyramidLayout, corners: &[Vec<Corner>], described: LevelDescriptions) -> CameraFeatures {
    let mut features = CameraFeatures::default();
    for ((info, level), (angles, descs)) in layout.levels.iter().zip(corners).zip(described) {
        for (c, angle) in level.iter().zip(angles) {
            features.keypoints.push(KeyPoint {
                x: c.x as f32 * info.scale,
                y: c.y as f32 * info.scale,
                response: c.response as f32,
                angle,
                octave: info.index as u32,
                size: PATCH_SIZE as f32 * info.scale,
            });
        }
        features.descriptors.extend(descs);
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that records calls and returns canned corners.
    #[derive(Default)]
    struct Scripted {
        detect_calls: usize,
        fail_with: Option<fn() -> ExtractorError>,
        levels: Vec<usize>,
        reload_fails: bool,
        lost: bool,
    }

    impl Backend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn submit_detect(&mut self, inputs: &[CameraInput<'_>]) -> Result<()> {
            self.detect_calls += 1;
            if let Some(f) = self.fail_with {
                return Err(f());
            }
            self.levels = inputs.iter().map(|i| i.layout.num_levels()).collect();
            Ok(())
        }

        fn finish_detect(&mut self) -> Result<Vec<LevelCorners>> {
            Ok(self
                .levels
                .iter()
                .map(|&n| (0..n).map(|_| vec![Corner::new(30, 40, 50)]).collect())
                .collect())
        }

        fn submit_describe(&mut self, _corners: &[LevelCorners]) -> Result<()> {
            Ok(())
        }

        fn finish_describe(&mut self) -> Result<Vec<LevelDescriptions>> {
            Ok(self
                .levels
                .iter()
                .map(|&n| (0..n).map(|l| (vec![l as f32], vec![[l as u8; 32]])).collect())
                .collect())
        }

        fn reload_kernels(&mut self, dir: &Path) -> Result<()> {
            if self.reload_fails {
                return Err(ExtractorError::DeviceUnavailable(format!("no kernels in {}", dir.display())));
            }
            Ok(())
        }

        fn check(&self) -> Result<()> {
            if self.lost {
                return Err(device_lost());
            }
            Ok(())
        }
    }

    fn device_lost() -> ExtractorError {
        ExtractorError::DeviceUnavailable("lost".into())
    }

    fn out_of_memory() -> ExtractorError {
        ExtractorError::OutOfMemory("full".into())
    }

    fn config(cameras: usize) -> ExtractorConfig {
        ExtractorConfig::new(100, 2.0, 2, 20, 7, cameras)
    }

    #[test]
    fn test_rescales_and_tags_levels() {
        let mut ex = OrbExtractor::with_backend(config(1), Scripted::default()).unwrap();
        let out = ex.extract(&[Image::new(100, 80)], &[]).unwrap();
        assert_eq!(out.len(), 1);
        let f = &out[0];
        assert_eq!(f.len(), 2);
        assert_eq!((f.keypoints[0].x, f.keypoints[0].y, f.keypoints[0].octave), (30.0, 40.0, 0));
        assert_eq!((f.keypoints[1].x, f.keypoints[1].y, f.keypoints[1].octave), (60.0, 80.0, 1));
        assert_eq!(f.keypoints[1].size, 62.0);
        assert_eq!(f.descriptors[1], [1u8; 32]);
        assert_eq!(f.descriptor_bytes().len(), 2 * CameraFeatures::descriptor_stride());
    }

    #[test]
    fn test_camera_and_mask_counts() {
        let mut ex = OrbExtractor::with_backend(config(2), Scripted::default()).unwrap();
        let img = Image::new(64, 64);
        assert!(matches!(ex.extract(&[img.clone()], &[]), Err(ExtractorError::SizeMismatch(_))));
        let r = ex.extract(&[img.clone(), img.clone()], &[img.clone()]);
        assert!(matches!(r, Err(ExtractorError::SizeMismatch(_))));
        assert_eq!(ex.backend().detect_calls, 0, "validation must precede device work");
    }

    #[test]
    fn test_errors_name_the_camera() {
        let mut ex = OrbExtractor::with_backend(config(2), Scripted::default()).unwrap();
        let img = Image::new(64, 64);
        let err = ex
            .extract(&[img.clone(), img.clone()], &[img.clone(), Image::new(32, 64)])
            .unwrap_err();
        assert!(err.to_string().contains("camera 1"), "{err}");

        let err = ex.extract(&[img.clone(), Image::new(0, 0)], &[]).unwrap_err();
        assert!(matches!(err, ExtractorError::InvalidArgument(_)));
        assert!(err.to_string().contains("camera 1"), "{err}");
    }

    #[test]
    fn test_device_failure_poisons() {
        let backend = Scripted {
            fail_with: Some(device_lost),
            ..Scripted::default()
        };
        let mut ex = OrbExtractor::with_backend(config(1), backend).unwrap();
        let img = [Image::new(64, 64)];
        assert!(ex.extract(&img, &[]).is_err());
        assert!(ex.is_poisoned());
        assert!(matches!(ex.extract(&img, &[]), Err(ExtractorError::DeviceUnavailable(_))));
        assert_eq!(ex.backend().detect_calls, 1);
    }

    #[test]
    fn test_failed_kernel_reload_keeps_extractor() {
        let backend = Scripted { reload_fails: true, ..Scripted::default() };
        let mut ex = OrbExtractor::with_backend(config(1), backend).unwrap();
        let err = ex.set_gpu_kernel_path("/nonexistent/kernels").unwrap_err();
        assert!(matches!(err, ExtractorError::DeviceUnavailable(_)), "{err}");
        assert!(!ex.is_poisoned());
        assert_eq!(ex.config().kernel_path, None);
        assert_eq!(ex.extract(&[Image::new(100, 80)], &[]).unwrap()[0].len(), 2);

        ex.backend.reload_fails = false;
        ex.set_gpu_kernel_path("/opt/kernels").unwrap();
        assert_eq!(ex.config().kernel_path.as_deref(), Some(Path::new("/opt/kernels")));
    }

    #[test]
    fn test_kernel_reload_on_lost_device_poisons() {
        let backend = Scripted { reload_fails: true, lost: true, ..Scripted::default() };
        let mut ex = OrbExtractor::with_backend(config(1), backend).unwrap();
        assert!(ex.set_gpu_kernel_path("/opt/kernels").is_err());
        assert!(ex.is_poisoned());
        assert!(matches!(ex.extract(&[Image::new(64, 64)], &[]), Err(ExtractorError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_oom_does_not_poison() {
        let backend = Scripted {
            fail_with: Some(out_of_memory),
            ..Scripted::default()
        };
        let mut ex = OrbExtractor::with_backend(config(1), backend).unwrap();
        assert!(ex.extract(&[Image::new(64, 64)], &[]).is_err());
        assert!(!ex.is_poisoned());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = ExtractorConfig::new(100, 1.0, 2, 20, 7, 1);
        assert!(OrbExtractor::with_backend(cfg, Scripted::default()).is_err());
    }
}
