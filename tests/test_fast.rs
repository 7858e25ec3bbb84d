// tests/test_fast.rs — Integration tests for grid FAST + keypoint distribution.
//
// Patterns are bright squares on a flat background: a square's corner sees
// a long dark arc on the 16-pixel circle, which is what the segment test
// looks for. Checkerboards make poor fixtures since their junctions split the
// circle into short alternating runs.
//
// With the default 19-pixel edge clip, pixels closer than 22 to an edge are
// never scanned, so every pattern below sits well inside a 120x120 image.

use orb_gpu::config::FastConfig;
use orb_gpu::distribute::{distribute, Bounds};
use orb_gpu::fast::{GridFast, LevelFilter, RetryPolicy};
use orb_gpu::image::Image;

/// Draw a filled rectangle of value `fg`.
fn draw_rect(img: &mut Image<u8>, x0: usize, y0: usize, w: usize, h: usize, fg: u8) {
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            img.set(x, y, fg);
        }
    }
}

fn rectangle_image() -> Image<u8> {
    let mut img = Image::filled(120, 120, 20u8);
    draw_rect(&mut img, 40, 40, 40, 40, 220);
    img
}

fn no_filter() -> LevelFilter<'static> {
    LevelFilter { mask: None, rects: Vec::new(), scale: 1.0 }
}

fn detector(nms: bool, retry: RetryPolicy, ini: u8, min: u8) -> GridFast {
    GridFast::new(FastConfig { nms, retry, ..FastConfig::default() }, ini, min)
}

// ===== Basic detection =====

#[test]
fn rectangle_corners_detected() {
    let det = detector(false, RetryPolicy::WholeImage, 30, 9);
    let corners = det.detect(&rectangle_image(), &no_filter());
    assert!(corners.len() >= 4, "expected at least 4 corners, got {}", corners.len());

    let tips = [(40, 40), (79, 40), (40, 79), (79, 79)];
    for c in &corners {
        let near = tips.iter().any(|&(tx, ty)| (c.x - tx).abs() <= 3 && (c.y - ty).abs() <= 3);
        assert!(near, "corner at ({}, {}) is far from the rectangle corners", c.x, c.y);
    }
    for &(tx, ty) in &tips {
        assert!(
            corners.iter().any(|c| (c.x - tx).abs() <= 3 && (c.y - ty).abs() <= 3),
            "no corner near ({tx}, {ty})"
        );
    }
}

#[test]
fn output_is_row_major() {
    let det = detector(false, RetryPolicy::WholeImage, 30, 9);
    let corners = det.detect(&rectangle_image(), &no_filter());
    assert!(corners.windows(2).all(|w| (w[0].y, w[0].x) < (w[1].y, w[1].x)));
}

#[test]
fn nms_thins_clusters() {
    let img = rectangle_image();
    let raw = detector(false, RetryPolicy::WholeImage, 30, 9).detect(&img, &no_filter());
    let thin = detector(true, RetryPolicy::WholeImage, 30, 9).detect(&img, &no_filter());
    assert!(!thin.is_empty(), "NMS should keep some corners");
    assert!(thin.len() < raw.len(), "NMS kept {} of {}", thin.len(), raw.len());
    assert!(thin.iter().all(|c| raw.contains(c)));
}

#[test]
fn smooth_gradient_has_no_corners() {
    let mut img = Image::new(120, 120);
    for y in 0..120 {
        for x in 0..120 {
            img.set(x, y, (x * 2) as u8);
        }
    }
    let det = detector(false, RetryPolicy::WholeImage, 20, 7);
    assert!(det.detect(&img, &no_filter()).is_empty());
}

#[test]
fn image_smaller_than_border_is_empty() {
    let mut img = Image::filled(40, 40, 20u8);
    draw_rect(&mut img, 15, 15, 10, 10, 220);
    let det = detector(false, RetryPolicy::WholeImage, 20, 7);
    assert!(det.detect(&img, &no_filter()).is_empty());
}

// ===== Threshold retry =====

#[test]
fn whole_image_retry_only_when_nothing_found() {
    // Contrast 12: invisible at 20, visible at 7.
    let mut faint = Image::filled(120, 120, 100u8);
    draw_rect(&mut faint, 40, 40, 40, 40, 112);
    let with_retry = detector(false, RetryPolicy::WholeImage, 20, 7).detect(&faint, &no_filter());
    assert!(!with_retry.is_empty());
    let without = detector(false, RetryPolicy::WholeImage, 20, 20).detect(&faint, &no_filter());
    assert!(without.is_empty());
}

#[test]
fn per_cell_retry_recovers_weak_cells() {
    // Strong square in cell (0, 0), faint square in cell (1, 1).
    let mut img = Image::filled(120, 120, 100u8);
    draw_rect(&mut img, 28, 28, 12, 12, 250);
    draw_rect(&mut img, 62, 62, 14, 14, 112);

    let whole = detector(false, RetryPolicy::WholeImage, 20, 7).detect(&img, &no_filter());
    let per_cell = detector(false, RetryPolicy::PerCell, 20, 7).detect(&img, &no_filter());
    assert!(whole.iter().any(|c| c.x < 54));
    assert!(whole.iter().all(|c| c.x < 54), "whole-image policy used the low threshold");
    assert!(per_cell.iter().any(|c| c.x >= 54 && c.y >= 54), "faint square not recovered");
    assert!(per_cell.len() > whole.len());
}

// ===== Mask and exclusion =====

#[test]
fn mask_suppresses_corners() {
    let img = rectangle_image();
    let mut mask = Image::filled(120, 120, 255u8);
    draw_rect(&mut mask, 0, 0, 60, 120, 0);
    let filter = LevelFilter { mask: Some(&mask), rects: Vec::new(), scale: 1.0 };
    let corners = detector(false, RetryPolicy::WholeImage, 30, 9).detect(&img, &filter);
    assert!(!corners.is_empty());
    assert!(corners.iter().all(|c| c.x >= 60));
}

#[test]
fn exclusion_is_tested_at_full_resolution() {
    // Level at scale 2: level x = 60 is full-resolution x = 120.
    let img = rectangle_image();
    let filter = LevelFilter { mask: None, rects: vec![[0.0, 120.0, 0.0, 240.0]], scale: 2.0 };
    let corners = detector(false, RetryPolicy::WholeImage, 30, 9).detect(&img, &filter);
    assert!(!corners.is_empty());
    assert!(corners.iter().all(|c| c.x >= 60));
}

// ===== Distribution on real detections =====

#[test]
fn distribution_caps_and_spreads() {
    let mut img = Image::filled(120, 120, 20u8);
    for (x, y) in [(28, 28), (60, 28), (28, 60), (60, 60)] {
        draw_rect(&mut img, x, y, 16, 16, 220);
    }
    let corners = detector(false, RetryPolicy::WholeImage, 30, 9).detect(&img, &no_filter());
    assert!(corners.len() > 8);

    let kept = distribute(&corners, Bounds::new(19.0, 19.0, 101.0, 101.0), 8);
    assert_eq!(kept.len(), 8);
    assert!(kept.windows(2).all(|w| (w[0].y, w[0].x) < (w[1].y, w[1].x)));
    // Every square keeps at least one corner.
    for (x, y) in [(28, 28), (60, 28), (28, 60), (60, 60)] {
        assert!(
            kept.iter().any(|c| (x - 3..x + 19).contains(&c.x) && (y - 3..y + 19).contains(&c.y)),
            "square at ({x}, {y}) lost all corners"
        );
    }
}
