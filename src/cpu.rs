// cpu.rs — host reference backend.
//
// Runs the same stages as the device path with the reference kernels of
// this crate, one camera after another. "Submit" does the work and keeps
// the results; "finish" hands them over. The GPU parity tests compare
// against this backend, and it serves machines without a usable adapter.

use crate::config::{BlurConfig, ExtractorConfig};
use crate::error::{ExtractorError, Result};
use crate::extractor::{Backend, CameraInput, LevelCorners, LevelDescriptions};
use crate::fast::{GridFast, LevelFilter};
use crate::gaussian::{blur_cols, blur_rows, gaussian_kernel_q8};
use crate::image::Image;
use crate::orb::describe_level;
use crate::pyramid::Pyramid;

/// Levels of one camera kept between the two phases.
struct CameraLevels {
    pyramid: Pyramid,
    blurred: Vec<Image<u8>>,
}

pub struct CpuBackend {
    fast: GridFast,
    blur: BlurConfig,
    weights: Vec<u32>,
    max_raw_keypoints: usize,
    cameras: Vec<CameraLevels>,
    detected: Option<Vec<LevelCorners>>,
    described: Option<Vec<LevelDescriptions>>,
}

impl CpuBackend {
    pub fn new(config: &ExtractorConfig) -> Result<Self> {
        let weights = gaussian_kernel_q8(config.blur.kernel_size, config.blur.sigma)?;
        Ok(CpuBackend {
            fast: GridFast::new(config.fast.clone(), config.ini_fast_threshold, config.min_fast_threshold),
            blur: config.blur.clone(),
            weights,
            max_raw_keypoints: config.fast.max_raw_keypoints,
            cameras: Vec::new(),
            detected: None,
            described: None,
        })
    }

    fn detect_camera(&self, input: &CameraInput<'_>) -> Result<(CameraLevels, LevelCorners)> {
        let pyramid = Pyramid::build(input.image, &input.layout)?;
        let masks = match input.mask {
            Some(m) => Some(Pyramid::build_masks(m, &input.layout)?),
            None => None,
        };
        let mut blurred = Vec::with_capacity(pyramid.num_levels());
        let mut corners = Vec::with_capacity(pyramid.num_levels());
        for (i, level) in pyramid.levels.iter().enumerate() {
            blurred.push(blur_cols(&blur_rows(level, &self.weights, self.blur.border), &self.weights, self.blur.border));
            let filter = LevelFilter {
                mask: masks.as_ref().map(|m| &m[i]),
                rects: input.rects.clone(),
                scale: input.layout.levels[i].scale,
            };
            let mut found = self.fast.detect(level, &filter);
            if found.len() > self.max_raw_keypoints {
                log::warn!(
                    "level {i}: {} raw corners exceed capacity {}, keeping the first {}",
                    found.len(),
                    self.max_raw_keypoints,
                    self.max_raw_keypoints
                );
                found.truncate(self.max_raw_keypoints);
            }
            corners.push(found);
        }
        Ok((CameraLevels { pyramid, blurred }, corners))
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn submit_detect(&mut self, inputs: &[CameraInput<'_>]) -> Result<()> {
        let mut cameras = Vec::with_capacity(inputs.len());
        let mut detected = Vec::with_capacity(inputs.len());
        for (cam, input) in inputs.iter().enumerate() {
            let (levels, corners) = self.detect_camera(input).map_err(|e| e.for_camera(cam))?;
            cameras.push(levels);
            detected.push(corners);
        }
        self.cameras = cameras;
        self.detected = Some(detected);
        Ok(())
    }

    fn finish_detect(&mut self) -> Result<Vec<LevelCorners>> {
        self.detected
            .take()
            .ok_or_else(|| ExtractorError::InvalidArgument("finish_detect without submit_detect".into()))
    }

    fn submit_describe(&mut self, corners: &[LevelCorners]) -> Result<()> {
        if corners.len() != self.cameras.len() {
            return Err(ExtractorError::SizeMismatch(format!(
                "corners for {} cameras, {} detected",
                corners.len(),
                self.cameras.len()
            )));
        }
        let described = self
            .cameras
            .iter()
            .zip(corners)
            .map(|(cam, levels)| {
                cam.pyramid
                    .levels
                    .iter()
                    .zip(&cam.blurred)
                    .zip(levels)
                    .map(|((img, blurred), cs)| describe_level(img, blurred, cs))
                    .collect()
            })
            .collect();
        self.described = Some(described);
        Ok(())
    }

    fn finish_describe(&mut self) -> Result<Vec<LevelDescriptions>> {
        self.cameras.clear();
        self.described
            .take()
            .ok_or_else(|| ExtractorError::InvalidArgument("finish_describe without submit_describe".into()))
    }
}
