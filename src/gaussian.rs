// gaussian.rs — separable Gaussian blur with selectable border handling.
//
// Two 1D passes, exactly like the device kernel (shaders/gaussian.wgsl):
//
//   blur_rows()  horizontal pass, u8 -> u32, weights in Q8
//   blur_cols()  vertical pass,   u32 -> u8, rounding (acc + 2^15) >> 16
//
// The 1D kernel is a sampled Gaussian quantized to integers summing to 256,
// so both passes are exact integer arithmetic. Host and device outputs are
// identical; against a floating-point Gaussian the quantization costs at
// most a couple of intensity levels.
//
// BORDER HANDLING
// ───────────────
// Samples outside [0, len) are synthesized by `border_interpolate`:
//
//   Constant     000000|abcdefgh|0000000   (zero fill)
//   Replicate    aaaaaa|abcdefgh|hhhhhhh
//   Reflect      fedcba|abcdefgh|hgfedcb
//   Reflect101   gfedcb|abcdefgh|gfedcba
//
// Source indices are resolved once per output column/row into a tap table,
// keeping the per-pixel loops free of branches.

use serde::{Deserialize, Serialize};

use crate::config::MAX_BLUR_KERNEL;
use crate::error::{ExtractorError, Result};
use crate::image::Image;

/// Fractional bits of each 1D kernel coefficient.
pub const KERNEL_BITS: u32 = 8;

/// How samples beyond the image edge are synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderType {
    Constant,
    Replicate,
    Reflect,
    Reflect101,
}

impl BorderType {
    /// Numeric code shared with the WGSL kernels.
    pub fn code(self) -> u32 {
        match self {
            BorderType::Constant => 0,
            BorderType::Replicate => 1,
            BorderType::Reflect => 2,
            BorderType::Reflect101 => 3,
        }
    }
}

/// Map an out-of-range coordinate back into `[0, len)`.
///
/// Returns `None` for `Constant` borders, meaning "use zero".
pub fn border_interpolate(p: isize, len: usize, border: BorderType) -> Option<usize> {
    let n = len as isize;
    if (0..n).contains(&p) {
        return Some(p as usize);
    }
    match border {
        BorderType::Constant => None,
        BorderType::Replicate => Some(if p < 0 { 0 } else { len - 1 }),
        BorderType::Reflect | BorderType::Reflect101 => {
            if len == 1 {
                return Some(0);
            }
            let delta = (border == BorderType::Reflect101) as isize;
            let mut p = p;
            while !(0..n).contains(&p) {
                p = if p < 0 { -p - 1 + delta } else { n - 1 - (p - n) - delta };
            }
            Some(p as usize)
        }
    }
}

/// Sampled, normalized 1D Gaussian of odd length `ksize`.
pub fn gaussian_kernel_1d(ksize: usize, sigma: f64) -> Vec<f64> {
    let half = (ksize / 2) as f64;
    let scale = -0.5 / (sigma * sigma);
    let raw: Vec<f64> = (0..ksize)
        .map(|i| {
            let x = i as f64 - half;
            (scale * x * x).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / sum).collect()
}

/// Quantize the Gaussian to Q8 integers summing exactly to 256.
///
/// The rounding residue is folded into the centre tap so the kernel stays
/// symmetric and a flat image stays flat.
pub fn gaussian_kernel_q8(ksize: usize, sigma: f64) -> Result<Vec<u32>> {
    if ksize % 2 == 0 || ksize > MAX_BLUR_KERNEL {
        return Err(ExtractorError::InvalidArgument(format!(
            "gaussian kernel size must be odd and <= {MAX_BLUR_KERNEL} (got {ksize})"
        )));
    }
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(ExtractorError::InvalidArgument(format!(
            "gaussian sigma must be positive (got {sigma})"
        )));
    }
    let one = (1u32 << KERNEL_BITS) as f64;
    let mut q: Vec<i64> = gaussian_kernel_1d(ksize, sigma)
        .iter()
        .map(|v| (v * one).round() as i64)
        .collect();
    let residue = one as i64 - q.iter().sum::<i64>();
    q[ksize / 2] += residue;
    Ok(q.into_iter().map(|v| v as u32).collect())
}

/// Source index per (output position, tap); `-1` marks a zero sample.
pub fn tap_table(len: usize, ksize: usize, border: BorderType) -> Vec<i32> {
    let half = (ksize / 2) as isize;
    let mut table = Vec::with_capacity(len * ksize);
    for p in 0..len as isize {
        for k in 0..ksize as isize {
            table.push(border_interpolate(p + k - half, len, border).map_or(-1, |s| s as i32));
        }
    }
    table
}

/// Horizontal pass: Q8-weighted sums, no rounding.
pub fn blur_rows(src: &Image<u8>, kernel: &[u32], border: BorderType) -> Image<u32> {
    let (w, h, k) = (src.width(), src.height(), kernel.len());
    let taps = tap_table(w, k, border);
    let mut dst = Image::<u32>::new(w, h);
    for y in 0..h {
        let row = src.row(y);
        let out = dst.row_mut(y);
        for (x, o) in out.iter_mut().enumerate() {
            let mut acc = 0u32;
            for (i, &kv) in kernel.iter().enumerate() {
                let s = taps[x * k + i];
                if s >= 0 {
                    acc += kv * row[s as usize] as u32;
                }
            }
            *o = acc;
        }
    }
    dst
}

/// Vertical pass: weighted sums of the row pass, rounded back to u8.
pub fn blur_cols(src: &Image<u32>, kernel: &[u32], border: BorderType) -> Image<u8> {
    let (w, h, k) = (src.width(), src.height(), kernel.len());
    let taps = tap_table(h, k, border);
    let round = 1u32 << (2 * KERNEL_BITS - 1);
    let mut dst = Image::<u8>::new(w, h);
    for y in 0..h {
        let out = dst.row_mut(y);
        for (x, o) in out.iter_mut().enumerate() {
            let mut acc = 0u32;
            for (i, &kv) in kernel.iter().enumerate() {
                let s = taps[y * k + i];
                if s >= 0 {
                    acc += kv * src.get(x, s as usize);
                }
            }
            *o = ((acc + round) >> (2 * KERNEL_BITS)).min(255) as u8;
        }
    }
    dst
}

/// Gaussian blur of an 8-bit image (CPU reference).
///
/// # Errors
/// `InvalidArgument` for an even or oversized kernel, a non-positive
/// sigma, or an empty image.
pub fn gaussian_blur(src: &Image<u8>, ksize: usize, sigma: f64, border: BorderType) -> Result<Image<u8>> {
    if src.is_empty() {
        return Err(ExtractorError::InvalidArgument("cannot blur an empty image".into()));
    }
    let kernel = gaussian_kernel_q8(ksize, sigma)?;
    let rows = blur_rows(src, &kernel, border);
    Ok(blur_cols(&rows, &kernel, border))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Direct 2D floating-point Gaussian, rounded to nearest.
    fn blur_f64(src: &Image<u8>, ksize: usize, sigma: f64, border: BorderType) -> Image<u8> {
        let k = gaussian_kernel_1d(ksize, sigma);
        let half = (ksize / 2) as isize;
        let mut dst = Image::<u8>::new(src.width(), src.height());
        for y in 0..src.height() {
            for x in 0..src.width() {
                let mut acc = 0.0;
                for (j, kj) in k.iter().enumerate() {
                    let sy = border_interpolate(y as isize + j as isize - half, src.height(), border);
                    for (i, ki) in k.iter().enumerate() {
                        let sx = border_interpolate(x as isize + i as isize - half, src.width(), border);
                        if let (Some(sx), Some(sy)) = (sx, sy) {
                            acc += kj * ki * src.get(sx, sy) as f64;
                        }
                    }
                }
                dst.set(x, y, acc.round().clamp(0.0, 255.0) as u8);
            }
        }
        dst
    }

    fn noise(w: usize, h: usize, seed: u32) -> Image<u8> {
        let mut rng = seed;
        Image::from_vec(w, h, (0..w * h).map(|_| {
            rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
            (rng >> 24) as u8
        }).collect())
    }

    const ALL: [BorderType; 4] = [
        BorderType::Constant,
        BorderType::Replicate,
        BorderType::Reflect,
        BorderType::Reflect101,
    ];

    #[test]
    fn test_border_interpolate_modes() {
        // len 8, the diagrams from the module header.
        assert_eq!(border_interpolate(-1, 8, BorderType::Replicate), Some(0));
        assert_eq!(border_interpolate(9, 8, BorderType::Replicate), Some(7));
        assert_eq!(border_interpolate(-1, 8, BorderType::Reflect), Some(0));
        assert_eq!(border_interpolate(-3, 8, BorderType::Reflect), Some(2));
        assert_eq!(border_interpolate(8, 8, BorderType::Reflect), Some(7));
        assert_eq!(border_interpolate(-1, 8, BorderType::Reflect101), Some(1));
        assert_eq!(border_interpolate(8, 8, BorderType::Reflect101), Some(6));
        assert_eq!(border_interpolate(-1, 8, BorderType::Constant), None);
        assert_eq!(border_interpolate(5, 8, BorderType::Constant), Some(5));
    }

    #[test]
    fn test_border_interpolate_tiny_images() {
        assert_eq!(border_interpolate(-3, 1, BorderType::Reflect101), Some(0));
        // Overshoot larger than the image folds back repeatedly.
        for b in [BorderType::Reflect, BorderType::Reflect101] {
            for p in -10..12 {
                let s = border_interpolate(p, 2, b).unwrap();
                assert!(s < 2, "{b:?} p={p} -> {s}");
            }
        }
    }

    #[test]
    fn test_q8_kernel_sums_to_256() {
        let k = gaussian_kernel_q8(7, 2.0).unwrap();
        assert_eq!(k.len(), 7);
        assert_eq!(k.iter().sum::<u32>(), 256);
        for i in 0..3 {
            assert_eq!(k[i], k[6 - i], "kernel not symmetric at {i}");
            assert!(k[i] < k[i + 1]);
        }
    }

    #[test]
    fn test_rejects_bad_kernel() {
        assert!(gaussian_kernel_q8(6, 2.0).is_err());
        assert!(gaussian_kernel_q8(17, 2.0).is_err());
        assert!(gaussian_kernel_q8(7, 0.0).is_err());
    }

    #[test]
    fn test_constant_image_unchanged_except_constant_border() {
        let img = Image::filled(20, 15, 200u8);
        for b in [BorderType::Replicate, BorderType::Reflect, BorderType::Reflect101] {
            let out = gaussian_blur(&img, 7, 2.0, b).unwrap();
            assert!(out.pixels().all(|(_, _, v)| v == 200), "{b:?}");
        }
        let out = gaussian_blur(&img, 7, 2.0, BorderType::Constant).unwrap();
        assert_eq!(out.get(10, 7), 200);
        assert!(out.get(0, 0) < 200, "zero fill should darken the corner");
    }

    #[test]
    fn test_within_tolerance_of_float_gaussian() {
        let img = noise(41, 29, 7);
        for b in ALL {
            let fixed = gaussian_blur(&img, 7, 2.0, b).unwrap();
            let float = blur_f64(&img, 7, 2.0, b);
            let worst = fixed
                .pixels()
                .map(|(x, y, v)| (v as i32 - float.get(x, y) as i32).abs())
                .max()
                .unwrap();
            assert!(worst <= 5, "{b:?}: max deviation {worst}");
        }
    }

    #[test]
    fn test_blur_reduces_variance() {
        let img = noise(32, 32, 3);
        let out = gaussian_blur(&img, 7, 2.0, BorderType::Reflect101).unwrap();
        let var = |im: &Image<u8>| {
            let n = (im.width() * im.height()) as f64;
            let mean = im.pixels().map(|(_, _, v)| v as f64).sum::<f64>() / n;
            im.pixels().map(|(_, _, v)| (v as f64 - mean).powi(2)).sum::<f64>() / n
        };
        assert!(var(&out) < var(&img) / 4.0);
    }
}
