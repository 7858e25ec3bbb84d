// tests/test_extractor.rs — end-to-end properties of the extractor.
//
// These run on the host reference backend so they need no GPU. The device
// backend is checked against the same backend in gpu::backend's tests.

use orb_gpu::config::{excluded, ExclusionRect, ExtractorConfig};
use orb_gpu::cpu::CpuBackend;
use orb_gpu::extractor::{CameraFeatures, OrbExtractor};
use orb_gpu::image::Image;
use orb_gpu::orb::PATCH_SIZE;
use orb_gpu::ExtractorError;

fn init_logging() {
    let _ = flexi_logger::Logger::try_with_env_or_str("warn").and_then(|l| l.start());
}

/// Smooth pattern plus noise; textured at every pyramid level.
fn scene(w: usize, h: usize, seed: u32) -> Image<u8> {
    let mut rng = seed;
    Image::from_vec(w, h, (0..w * h).map(|i| {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        let (x, y) = ((i % w) as f32, (i / w) as f32);
        let base = 128.0 + 60.0 * (x / 9.0).sin() * (y / 7.0).cos();
        (base + ((rng >> 24) as f32 - 128.0) * 0.3).clamp(0.0, 255.0) as u8
    }).collect())
}

fn extractor(cfg: ExtractorConfig) -> OrbExtractor<CpuBackend> {
    init_logging();
    OrbExtractor::cpu(cfg).expect("valid config")
}

fn stereo_config() -> ExtractorConfig {
    ExtractorConfig::new(1000, 1.2, 8, 20, 7, 2)
}

// ===== Shape of the output =====

#[test]
fn descriptors_align_with_keypoints() {
    let mut ex = extractor(ExtractorConfig::new(800, 1.2, 6, 20, 7, 1));
    let out = ex.extract(&[scene(320, 240, 5)], &[]).unwrap();
    let f = &out[0];
    assert!(!f.is_empty());
    assert_eq!(f.keypoints.len(), f.descriptors.len());
    assert_eq!(f.descriptor_bytes().len(), f.len() * CameraFeatures::descriptor_stride());
    for kp in &f.keypoints {
        assert!((0.0..360.0).contains(&kp.angle), "angle {}", kp.angle);
        assert!((kp.octave as usize) < 6);
        let scale = 1.2f32.powi(kp.octave as i32);
        assert!((kp.size - PATCH_SIZE as f32 * scale).abs() < 1e-3);
        assert!(kp.response >= 7.0);
    }
}

#[test]
fn keypoints_respect_edge_clip() {
    let cfg = ExtractorConfig::new(1000, 1.2, 4, 20, 7, 1);
    let edge = (cfg.fast.edge_clip + 3) as f32;
    let mut ex = extractor(cfg);
    let out = ex.extract(&[scene(300, 200, 8)], &[]).unwrap();
    for kp in &out[0].keypoints {
        let s = 1.2f32.powi(kp.octave as i32);
        let (lx, ly) = ((kp.x / s).round(), (kp.y / s).round());
        let (lw, lh) = ((300.0 / s).round(), (200.0 / s).round());
        assert!(lx >= edge && ly >= edge && lx < lw - edge && ly < lh - edge, "{kp:?}");
    }
}

// ===== Multi-camera consistency =====

#[test]
fn identical_cameras_give_identical_features() {
    let mut ex = extractor(stereo_config());
    let img = scene(320, 240, 11);
    let out = ex.extract(&[img.clone(), img], &[]).unwrap();
    assert_eq!(out.len(), 2);
    assert!(!out[0].is_empty());
    assert_eq!(out[0], out[1]);
}

#[test]
fn cameras_are_independent() {
    let mut ex = extractor(stereo_config());
    let (a, b) = (scene(320, 240, 1), scene(320, 240, 2));
    let both = ex.extract(&[a.clone(), b.clone()], &[]).unwrap();
    let swapped = ex.extract(&[b, a], &[]).unwrap();
    assert_eq!(both[0], swapped[1]);
    assert_eq!(both[1], swapped[0]);
}

// ===== Budget and spread =====

#[test]
fn budget_is_never_exceeded() {
    for budget in [50, 300, 1000] {
        let mut ex = extractor(ExtractorConfig::new(budget, 1.2, 8, 20, 7, 1));
        let out = ex.extract(&[scene(640, 480, 3)], &[]).unwrap();
        assert!(out[0].len() <= budget, "{} > {budget}", out[0].len());
        assert!(out[0].len() >= budget / 2, "only {} of {budget}", out[0].len());
    }
}

#[test]
fn keypoints_cover_all_quadrants() {
    let mut ex = extractor(ExtractorConfig::new(1000, 1.2, 8, 20, 7, 1));
    let out = ex.extract(&[scene(640, 480, 4)], &[]).unwrap();
    let f = &out[0];
    let mut quadrants = [0usize; 4];
    for kp in &f.keypoints {
        let q = (kp.x >= 320.0) as usize + 2 * (kp.y >= 240.0) as usize;
        quadrants[q] += 1;
    }
    for (q, &n) in quadrants.iter().enumerate() {
        assert!(n * 10 >= f.len(), "quadrant {q} holds {n} of {}", f.len());
    }
}

// ===== Masks and exclusion rectangles =====

#[test]
fn masked_pixels_yield_no_keypoints() {
    let mut ex = extractor(stereo_config());
    let img = scene(320, 240, 6);
    let mut mask = Image::filled(320, 240, 255u8);
    for y in 60..180 {
        for x in 100..260 {
            mask.set(x, y, 0);
        }
    }
    let open = Image::filled(320, 240, 255u8);
    let out = ex.extract(&[img.clone(), img], &[open, mask.clone()]).unwrap();
    assert!(!out[1].is_empty());
    for kp in &out[1].keypoints {
        let (x, y) = ((kp.x as usize).min(319), (kp.y as usize).min(239));
        assert_ne!(mask.get(x, y), 0, "keypoint {kp:?} under the mask");
    }
    // The unmasked camera does find keypoints in that region.
    assert!(out[0].keypoints.iter().any(|kp| mask.get(kp.x as usize, kp.y as usize) == 0));
}

#[test]
fn exclusion_rects_are_honoured() {
    let rects = vec![ExclusionRect::new(0.0, 0.5, 0.5, 1.0), ExclusionRect::new(0.8, 1.0, 0.0, 0.2)];
    let cfg = ExtractorConfig::new(1000, 1.2, 8, 20, 7, 1).with_exclusion_rects(vec![rects.clone()]);
    let mut ex = extractor(cfg);
    let out = ex.extract(&[scene(400, 300, 7)], &[]).unwrap();
    let px: Vec<[f32; 4]> = rects.iter().map(|r| r.to_pixels(400, 300)).collect();
    assert!(!out[0].is_empty());
    for kp in &out[0].keypoints {
        assert!(!excluded(&px, kp.x, kp.y), "keypoint {kp:?} inside an exclusion rect");
    }
}

// ===== Repeatability and degenerate input =====

#[test]
fn repeated_calls_are_identical() {
    let mut ex = extractor(stereo_config());
    let images = [scene(320, 240, 9), scene(320, 240, 10)];
    let first = ex.extract(&images, &[]).unwrap();
    let second = ex.extract(&images, &[]).unwrap();
    assert_eq!(first, second);
}

#[test]
fn blank_image_has_no_keypoints() {
    let mut ex = extractor(stereo_config());
    let blank = Image::filled(320, 240, 128u8);
    let out = ex.extract(&[blank.clone(), blank], &[]).unwrap();
    assert!(out.iter().all(CameraFeatures::is_empty));
}

#[test]
fn tiny_image_is_valid_and_empty() {
    let mut ex = extractor(ExtractorConfig::new(100, 1.2, 4, 20, 7, 1));
    let out = ex.extract(&[scene(30, 20, 1)], &[]).unwrap();
    assert!(out[0].is_empty());
}

#[test]
fn mask_size_mismatch_is_rejected() {
    let mut ex = extractor(stereo_config());
    let img = scene(320, 240, 1);
    let err = ex
        .extract(&[img.clone(), img], &[Image::filled(320, 240, 255), Image::filled(160, 120, 255)])
        .unwrap_err();
    assert!(matches!(err, ExtractorError::SizeMismatch(_)));
    assert!(!ex.is_poisoned());
}
