// orb.rs — keypoint orientation and rotated BRIEF descriptor (CPU reference).
//
// ORIENTATION
// ───────────
// The intensity centroid of a circular patch of radius 15 on the
// *unblurred* level image:
//
//   m10 = Σ u·I(x+u, y+v)     m01 = Σ v·I(x+u, y+v)     angle = atan2(m01, m10)
//
// The disc is described by `umax[v]`, the half-width of row v. The table
// is made symmetric under transposition so that rotating an image by 90°
// rotates the disc onto itself.
//
// DESCRIPTOR
// ──────────
// On the *blurred* level image, every pattern pair (a, b) is rotated by the
// keypoint angle and rounded to the nearest pixel:
//
//   row = rint(px·sin + py·cos)     col = rint(px·cos − py·sin)
//
// Bit j of byte i is set iff I(a) < I(b) for pair 8i + j.
//
// Both atan2 and sin/cos are low-order polynomials, so the device kernel in
// shaders/orb.wgsl evaluates the same formulas. GPUs may fuse the
// multiply-adds, which can move a rounded sample by one pixel in rare
// cases; parity is therefore checked with a small Hamming tolerance.

use std::f32::consts::{FRAC_PI_2, PI, TAU};

use crate::fast::Corner;
use crate::image::Image;
use crate::pattern::BIT_PATTERN_31;

pub const HALF_PATCH_SIZE: usize = 15;
pub const PATCH_SIZE: usize = 2 * HALF_PATCH_SIZE + 1;
pub const DESCRIPTOR_BYTES: usize = 32;

/// 256-bit binary descriptor.
pub type Descriptor = [u8; DESCRIPTOR_BYTES];

const ATAN2_P1: f32 = 0.999_787_841_279_480_7 * 57.295_779_513_082_32;
const ATAN2_P3: f32 = -0.325_808_397_464_097_5 * 57.295_779_513_082_32;
const ATAN2_P5: f32 = 0.155_578_651_846_328_1 * 57.295_779_513_082_32;
const ATAN2_P7: f32 = -0.044_326_555_547_921_28 * 57.295_779_513_082_32;
const ATAN2_EPS: f32 = f32::EPSILON;

const COS_C1: f32 = 0.999_403_07;
const COS_C2: f32 = -0.495_580_72;
const COS_C3: f32 = 0.036_791_68;

/// Half-width of each patch row, `umax[v]` for `v` in `0..=15`.
pub fn umax_table() -> [i32; HALF_PATCH_SIZE + 1] {
    let hp = HALF_PATCH_SIZE as f64;
    let vmax = (hp * std::f64::consts::SQRT_2 / 2.0 + 1.0).floor() as usize;
    let vmin = (hp * std::f64::consts::SQRT_2 / 2.0).ceil() as usize;
    let mut umax = [0i32; HALF_PATCH_SIZE + 1];
    for (v, u) in umax.iter_mut().enumerate().take(vmax + 1) {
        *u = (hp * hp - (v * v) as f64).sqrt().round_ties_even() as i32;
    }
    // Mirror the lower octant so the disc is symmetric about the diagonal.
    let mut v0 = 0usize;
    for v in (vmin..=HALF_PATCH_SIZE).rev() {
        while umax[v0] == umax[v0 + 1] {
            v0 += 1;
        }
        umax[v] = v0 as i32;
        v0 += 1;
    }
    umax
}

/// atan2 in degrees, `[0, 360)`, 7th-order polynomial.
pub fn fast_atan2(y: f32, x: f32) -> f32 {
    let (ax, ay) = (x.abs(), y.abs());
    let poly = |c: f32| {
        let c2 = c * c;
        (((ATAN2_P7 * c2 + ATAN2_P5) * c2 + ATAN2_P3) * c2 + ATAN2_P1) * c
    };
    let mut a = if ax >= ay {
        poly(ay / (ax + ATAN2_EPS))
    } else {
        90.0 - poly(ax / (ay + ATAN2_EPS))
    };
    if x < 0.0 {
        a = 180.0 - a;
    }
    if y < 0.0 {
        a = 360.0 - a;
    }
    a
}

/// Polynomial cosine, any argument in radians.
pub fn poly_cos(x: f32) -> f32 {
    let mut x = x.rem_euclid(TAU);
    if x > PI {
        x = TAU - x;
    }
    let (x, sign) = if x > FRAC_PI_2 { (PI - x, -1.0) } else { (x, 1.0) };
    let x2 = x * x;
    sign * (COS_C1 + x2 * (COS_C2 + x2 * COS_C3))
}

pub fn poly_sin(x: f32) -> f32 {
    poly_cos(x - FRAC_PI_2)
}

/// First-order moments `(m10, m01)` of the disc around `(x, y)`.
pub fn intensity_centroid(img: &Image<u8>, x: i32, y: i32, umax: &[i32]) -> (i32, i32) {
    let px = |u: i32, v: i32| img.get_clamped((x + u) as isize, (y + v) as isize) as i32;
    let r = HALF_PATCH_SIZE as i32;
    let mut m10 = 0i32;
    let mut m01 = 0i32;
    for u in -r..=r {
        m10 += u * px(u, 0);
    }
    for v in 1..=r {
        let d = umax[v as usize];
        let mut v_sum = 0;
        for u in -d..=d {
            let (plus, minus) = (px(u, v), px(u, -v));
            v_sum += plus - minus;
            m10 += u * (plus + minus);
        }
        m01 += v * v_sum;
    }
    (m10, m01)
}

/// Keypoint angle in degrees from the intensity centroid.
pub fn compute_orientation(img: &Image<u8>, x: i32, y: i32, umax: &[i32]) -> f32 {
    let (m10, m01) = intensity_centroid(img, x, y, umax);
    fast_atan2(m01 as f32, m10 as f32)
}

/// Rotated BRIEF descriptor of the keypoint at `(x, y)`, `angle` in degrees.
pub fn compute_descriptor(blurred: &Image<u8>, x: i32, y: i32, angle: f32) -> Descriptor {
    let rad = angle * (PI / 180.0);
    let (a, b) = (poly_cos(rad), poly_sin(rad));
    let sample = |px: i8, py: i8| {
        let (px, py) = (px as f32, py as f32);
        let row = (px * b + py * a).round_ties_even() as i32;
        let col = (px * a - py * b).round_ties_even() as i32;
        blurred.get_clamped((x + col) as isize, (y + row) as isize)
    };
    let mut desc = [0u8; DESCRIPTOR_BYTES];
    for (i, byte) in desc.iter_mut().enumerate() {
        for j in 0..8 {
            let p = &BIT_PATTERN_31[8 * i + j];
            if sample(p[0], p[1]) < sample(p[2], p[3]) {
                *byte |= 1 << j;
            }
        }
    }
    desc
}

/// Orientation on `img` and descriptor on `blurred` for every corner.
pub fn describe_level(img: &Image<u8>, blurred: &Image<u8>, corners: &[Corner]) -> (Vec<f32>, Vec<Descriptor>) {
    let umax = umax_table();
    corners
        .iter()
        .map(|c| {
            let angle = compute_orientation(img, c.x, c.y, &umax);
            (angle, compute_descriptor(blurred, c.x, c.y, angle))
        })
        .unzip()
}

/// Number of differing bits.
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(w: usize, h: usize, seed: u32) -> Image<u8> {
        let mut rng = seed;
        Image::from_vec(w, h, (0..w * h).map(|_| {
            rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
            (rng >> 24) as u8
        }).collect())
    }

    fn angle_diff(a: f32, b: f32) -> f32 {
        ((a - b + 540.0).rem_euclid(360.0) - 180.0).abs()
    }

    #[test]
    fn test_umax_table() {
        assert_eq!(umax_table(), [15, 15, 15, 15, 14, 14, 14, 13, 13, 12, 11, 10, 9, 8, 6, 3]);
    }

    #[test]
    fn test_fast_atan2_accuracy() {
        for i in -20..=20 {
            for j in -20..=20 {
                if (i, j) == (0, 0) {
                    continue;
                }
                let (y, x) = (i as f32 * 3.7, j as f32 * 2.1);
                let exact = y.atan2(x).to_degrees().rem_euclid(360.0);
                let got = fast_atan2(y, x);
                assert!((0.0..360.0).contains(&got), "atan2({y}, {x}) = {got}");
                assert!(angle_diff(got, exact) < 0.02, "atan2({y}, {x}): {got} vs {exact}");
            }
        }
    }

    #[test]
    fn test_atan2_coefficients_match_shader() {
        let wgsl = include_str!("shaders/orb.wgsl");
        let coeff = |name: &str| -> f32 {
            let line = wgsl
                .lines()
                .find(|l| l.starts_with(&format!("const {name}: f32 =")))
                .unwrap_or_else(|| panic!("{name} missing from orb.wgsl"));
            let lit = line.split('=').nth(1).unwrap().split('*').next().unwrap().trim();
            lit.parse::<f32>().unwrap() * 57.295_779_513_082_32
        };
        assert_eq!(coeff("ATAN2_P1"), ATAN2_P1);
        assert_eq!(coeff("ATAN2_P3"), ATAN2_P3);
        assert_eq!(coeff("ATAN2_P5"), ATAN2_P5);
        assert_eq!(coeff("ATAN2_P7"), ATAN2_P7);
        assert!(wgsl.contains("-0.04432655554792128 * DEG"));
    }

    #[test]
    fn test_poly_trig_accuracy() {
        for i in -720..=720 {
            let x = i as f32 * 0.01;
            assert!((poly_cos(x) - x.cos()).abs() < 1e-3, "cos({x})");
            assert!((poly_sin(x) - x.sin()).abs() < 1e-3, "sin({x})");
        }
    }

    #[test]
    fn test_orientation_follows_gradient() {
        let umax = umax_table();
        let ramp_x = Image::from_vec(64, 64, (0..64 * 64).map(|i| ((i % 64) * 3) as u8).collect());
        let ramp_y = Image::from_vec(64, 64, (0..64 * 64).map(|i| ((i / 64) * 3) as u8).collect());
        let falling_x = Image::from_vec(64, 64, (0..64 * 64).map(|i| (255 - (i % 64) * 3) as u8).collect());
        assert!(angle_diff(compute_orientation(&ramp_x, 32, 32, &umax), 0.0) < 0.1);
        assert!(angle_diff(compute_orientation(&ramp_y, 32, 32, &umax), 90.0) < 0.1);
        assert!(angle_diff(compute_orientation(&falling_x, 32, 32, &umax), 180.0) < 0.1);
    }

    #[test]
    fn test_flat_patch_has_empty_descriptor() {
        let img = Image::filled(64, 64, 90u8);
        assert_eq!(compute_descriptor(&img, 32, 32, 37.0), [0u8; DESCRIPTOR_BYTES]);
    }

    #[test]
    fn test_unrotated_descriptor_on_ramp() {
        // Strictly increasing in x: bit set iff a lies left of b.
        let img = Image::from_vec(64, 64, (0..64 * 64).map(|i| ((i % 64) * 4) as u8).collect());
        let d = compute_descriptor(&img, 32, 32, 0.0);
        for (k, p) in BIT_PATTERN_31.iter().enumerate() {
            let bit = (d[k / 8] >> (k % 8)) & 1 == 1;
            assert_eq!(bit, p[0] < p[2], "pair {k}: {p:?}");
        }
    }

    #[test]
    fn test_quarter_turn_invariance() {
        // R(u, v) = I(v, 64 - u) is I rotated a quarter turn about (32, 32).
        let img = noise(65, 65, 11);
        let mut rot = Image::<u8>::new(65, 65);
        for v in 0..65 {
            for u in 0..65 {
                rot.set(u, v, img.get(v, 64 - u));
            }
        }
        let d0 = compute_descriptor(&img, 32, 32, 0.0);
        let d90 = compute_descriptor(&rot, 32, 32, 90.0);
        assert_eq!(d0, d90);
    }

    #[test]
    fn test_noise_descriptors_are_balanced_and_distinct() {
        let img = noise(128, 128, 5);
        let corners = [Corner::new(40, 40, 10), Corner::new(90, 70, 12)];
        let (angles, descs) = describe_level(&img, &img, &corners);
        assert_eq!(angles.len(), 2);
        for d in &descs {
            let ones: u32 = d.iter().map(|b| b.count_ones()).sum();
            assert!((80..=176).contains(&ones), "{ones} bits set");
        }
        assert!(hamming(&descs[0], &descs[1]) > 60);
    }
}
