//! Luminance: RGB24 rows to 8-bit luma.
//!
//! `Y = (77·R + 150·G + 29·B) >> 8` in u16 arithmetic (the weights sum to
//! 256, so the result fits a byte with no clamp). The scalar routine is
//! the reference; the SIMD paths compute the identical integer expression
//! and must produce byte-identical rows.

#[cfg(target_arch = "aarch64")]
mod neon;
#[cfg(target_arch = "x86_64")]
mod x86;

pub const R_WEIGHT: u16 = 77;
pub const G_WEIGHT: u16 = 150;
pub const B_WEIGHT: u16 = 29;

/// Which luminance implementation to run.
///
/// Values other than `Scalar` are only handed out by [`detect`] (or by
/// [`available`] in tests), which guarantees the CPU supports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LumaPath {
    Scalar,
    Sse2,
    Ssse3,
    Avx2,
    Neon,
}

impl LumaPath {
    pub fn name(self) -> &'static str {
        match self {
            LumaPath::Scalar => "scalar",
            LumaPath::Sse2 => "sse2",
            LumaPath::Ssse3 => "ssse3",
            LumaPath::Avx2 => "avx2",
            LumaPath::Neon => "neon",
        }
    }
}

/// Probe the CPU and pick the widest supported path.
pub fn detect() -> LumaPath {
    detect_impl()
}

#[cfg(target_arch = "x86_64")]
fn detect_impl() -> LumaPath {
    if is_x86_feature_detected!("avx2") {
        LumaPath::Avx2
    } else if is_x86_feature_detected!("ssse3") {
        LumaPath::Ssse3
    } else if is_x86_feature_detected!("sse2") {
        LumaPath::Sse2
    } else {
        LumaPath::Scalar
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_impl() -> LumaPath {
    // NEON is baseline on aarch64.
    LumaPath::Neon
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_impl() -> LumaPath {
    LumaPath::Scalar
}

/// Every path this CPU can run, scalar first.
pub fn available() -> Vec<LumaPath> {
    let mut paths = vec![LumaPath::Scalar];
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("sse2") {
            paths.push(LumaPath::Sse2);
        }
        if is_x86_feature_detected!("ssse3") {
            paths.push(LumaPath::Ssse3);
        }
        if is_x86_feature_detected!("avx2") {
            paths.push(LumaPath::Avx2);
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        paths.push(LumaPath::Neon);
    }
    paths
}

#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((R_WEIGHT * r as u16 + G_WEIGHT * g as u16 + B_WEIGHT * b as u16) >> 8) as u8
}

/// Scalar reference.
pub fn luma_row_scalar(rgb: &[u8], out: &mut [u8]) {
    debug_assert_eq!(rgb.len(), out.len() * 3);
    for (px, y) in rgb.chunks_exact(3).zip(out.iter_mut()) {
        *y = luma(px[0], px[1], px[2]);
    }
}

/// Convert one row of RGB24 (`out.len()` pixels) through `path`.
///
/// `path` must have come from [`detect`]/[`available`] on this machine;
/// paths compiled out for the current architecture fall back to scalar.
pub fn luma_row(path: LumaPath, rgb: &[u8], out: &mut [u8]) {
    debug_assert_eq!(rgb.len(), out.len() * 3);
    match path {
        LumaPath::Scalar => luma_row_scalar(rgb, out),
        #[cfg(target_arch = "x86_64")]
        // SAFETY: the path came from the runtime probe, so the required
        // CPU features are present.
        LumaPath::Sse2 => unsafe { x86::luma_row_sse2(rgb, out) },
        #[cfg(target_arch = "x86_64")]
        LumaPath::Ssse3 => unsafe { x86::luma_row_ssse3(rgb, out) },
        #[cfg(target_arch = "x86_64")]
        LumaPath::Avx2 => unsafe { x86::luma_row_avx2(rgb, out) },
        #[cfg(target_arch = "aarch64")]
        LumaPath::Neon => unsafe { neon::luma_row_neon(rgb, out) },
        #[allow(unreachable_patterns)]
        _ => luma_row_scalar(rgb, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(pixels: usize) -> Vec<u8> {
        // Deterministic pseudo-random bytes covering the value range.
        let mut state = 0x2545_F491u32;
        (0..pixels * 3)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn scalar_weights_sum_to_one() {
        assert_eq!(R_WEIGHT + G_WEIGHT + B_WEIGHT, 256);
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(128, 128, 128), 128);
    }

    // Every supported SIMD path is byte-identical to scalar, across
    // widths that exercise both the vector body and the scalar tail.
    #[test]
    fn all_paths_match_scalar() {
        for &pixels in &[1usize, 7, 8, 15, 16, 17, 31, 32, 33, 63, 64, 257, 1280] {
            let rgb = test_image(pixels);
            let mut reference = vec![0u8; pixels];
            luma_row_scalar(&rgb, &mut reference);
            for path in available() {
                let mut out = vec![0u8; pixels];
                luma_row(path, &rgb, &mut out);
                assert_eq!(out, reference, "path {} at width {}", path.name(), pixels);
            }
        }
    }

    #[test]
    fn extreme_values_match_across_paths() {
        // Saturated channels stress the 16-bit accumulators.
        let mut rgb = Vec::new();
        for _ in 0..64 {
            rgb.extend_from_slice(&[255, 255, 255]);
            rgb.extend_from_slice(&[255, 0, 0]);
            rgb.extend_from_slice(&[0, 255, 0]);
            rgb.extend_from_slice(&[0, 0, 255]);
        }
        let pixels = rgb.len() / 3;
        let mut reference = vec![0u8; pixels];
        luma_row_scalar(&rgb, &mut reference);
        for path in available() {
            let mut out = vec![0u8; pixels];
            luma_row(path, &rgb, &mut out);
            assert_eq!(out, reference, "path {}", path.name());
        }
    }

    #[test]
    fn detect_returns_an_available_path() {
        assert!(available().contains(&detect()));
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            // Property form: arbitrary pixel data, arbitrary width.
            #[test]
            fn simd_equals_scalar(rgb in proptest::collection::vec(any::<u8>(), 0..600)) {
                let pixels = rgb.len() / 3;
                let rgb = &rgb[..pixels * 3];
                let mut reference = vec![0u8; pixels];
                luma_row_scalar(rgb, &mut reference);
                for path in available() {
                    let mut out = vec![0u8; pixels];
                    luma_row(path, rgb, &mut out);
                    prop_assert_eq!(&out, &reference, "path {}", path.name());
                }
            }
        }
    }
}
