//! x86-64 luminance paths.
//!
//! All paths compute `(77R + 150G + 29B) >> 8` in 16-bit lanes, exactly
//! like the scalar reference. `mullo`/`add` wrap at 16 bits, which is
//! harmless: the true sum never exceeds 65280.

#![allow(unsafe_op_in_unsafe_fn)]

use core::arch::x86_64::*;

use super::{luma_row_scalar, B_WEIGHT, G_WEIGHT, R_WEIGHT};

/// SSE2: no byte shuffle available, so channels are gathered into u16
/// lanes in scalar code and only the arithmetic is vectorized.
///
/// # Safety
/// Caller must ensure SSE2 is supported (runtime probe) and
/// `rgb.len() == out.len() * 3`.
#[target_feature(enable = "sse2")]
pub unsafe fn luma_row_sse2(rgb: &[u8], out: &mut [u8]) {
    let pixels = out.len();
    let wr = _mm_set1_epi16(R_WEIGHT as i16);
    let wg = _mm_set1_epi16(G_WEIGHT as i16);
    let wb = _mm_set1_epi16(B_WEIGHT as i16);

    let mut i = 0;
    while i + 8 <= pixels {
        let mut r = [0u16; 8];
        let mut g = [0u16; 8];
        let mut b = [0u16; 8];
        for k in 0..8 {
            let p = (i + k) * 3;
            r[k] = rgb[p] as u16;
            g[k] = rgb[p + 1] as u16;
            b[k] = rgb[p + 2] as u16;
        }
        let rv = _mm_loadu_si128(r.as_ptr() as *const __m128i);
        let gv = _mm_loadu_si128(g.as_ptr() as *const __m128i);
        let bv = _mm_loadu_si128(b.as_ptr() as *const __m128i);
        let sum = _mm_add_epi16(
            _mm_add_epi16(_mm_mullo_epi16(rv, wr), _mm_mullo_epi16(gv, wg)),
            _mm_mullo_epi16(bv, wb),
        );
        let y = _mm_srli_epi16(sum, 8);
        let packed = _mm_packus_epi16(y, y);
        _mm_storel_epi64(out.as_mut_ptr().add(i) as *mut __m128i, packed);
        i += 8;
    }
    luma_row_scalar(&rgb[i * 3..], &mut out[i..]);
}

// pshufb masks deinterleaving 48 interleaved RGB bytes (three 16-byte
// vectors) into one 16-byte vector per channel. -1 lanes read as zero.
#[target_feature(enable = "ssse3")]
unsafe fn deinterleave_16px(ptr: *const u8) -> (__m128i, __m128i, __m128i) {
    let v0 = _mm_loadu_si128(ptr as *const __m128i);
    let v1 = _mm_loadu_si128(ptr.add(16) as *const __m128i);
    let v2 = _mm_loadu_si128(ptr.add(32) as *const __m128i);

    let r = _mm_or_si128(
        _mm_or_si128(
            _mm_shuffle_epi8(
                v0,
                _mm_setr_epi8(0, 3, 6, 9, 12, 15, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1),
            ),
            _mm_shuffle_epi8(
                v1,
                _mm_setr_epi8(-1, -1, -1, -1, -1, -1, 2, 5, 8, 11, 14, -1, -1, -1, -1, -1),
            ),
        ),
        _mm_shuffle_epi8(
            v2,
            _mm_setr_epi8(-1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, 1, 4, 7, 10, 13),
        ),
    );
    let g = _mm_or_si128(
        _mm_or_si128(
            _mm_shuffle_epi8(
                v0,
                _mm_setr_epi8(1, 4, 7, 10, 13, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1),
            ),
            _mm_shuffle_epi8(
                v1,
                _mm_setr_epi8(-1, -1, -1, -1, -1, 0, 3, 6, 9, 12, 15, -1, -1, -1, -1, -1),
            ),
        ),
        _mm_shuffle_epi8(
            v2,
            _mm_setr_epi8(-1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, 2, 5, 8, 11, 14),
        ),
    );
    let b = _mm_or_si128(
        _mm_or_si128(
            _mm_shuffle_epi8(
                v0,
                _mm_setr_epi8(2, 5, 8, 11, 14, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1),
            ),
            _mm_shuffle_epi8(
                v1,
                _mm_setr_epi8(-1, -1, -1, -1, -1, 1, 4, 7, 10, 13, -1, -1, -1, -1, -1, -1),
            ),
        ),
        _mm_shuffle_epi8(
            v2,
            _mm_setr_epi8(-1, -1, -1, -1, -1, -1, -1, -1, -1, -1, 0, 3, 6, 9, 12, 15),
        ),
    );
    (r, g, b)
}

#[target_feature(enable = "ssse3")]
unsafe fn weighted_sum_128(r: __m128i, g: __m128i, b: __m128i) -> __m128i {
    let zero = _mm_setzero_si128();
    let wr = _mm_set1_epi16(R_WEIGHT as i16);
    let wg = _mm_set1_epi16(G_WEIGHT as i16);
    let wb = _mm_set1_epi16(B_WEIGHT as i16);

    let lo = _mm_srli_epi16(
        _mm_add_epi16(
            _mm_add_epi16(
                _mm_mullo_epi16(_mm_unpacklo_epi8(r, zero), wr),
                _mm_mullo_epi16(_mm_unpacklo_epi8(g, zero), wg),
            ),
            _mm_mullo_epi16(_mm_unpacklo_epi8(b, zero), wb),
        ),
        8,
    );
    let hi = _mm_srli_epi16(
        _mm_add_epi16(
            _mm_add_epi16(
                _mm_mullo_epi16(_mm_unpackhi_epi8(r, zero), wr),
                _mm_mullo_epi16(_mm_unpackhi_epi8(g, zero), wg),
            ),
            _mm_mullo_epi16(_mm_unpackhi_epi8(b, zero), wb),
        ),
        8,
    );
    _mm_packus_epi16(lo, hi)
}

/// SSSE3: 16 pixels per iteration via pshufb deinterleave.
///
/// # Safety
/// Caller must ensure SSSE3 is supported and `rgb.len() == out.len() * 3`.
#[target_feature(enable = "ssse3")]
pub unsafe fn luma_row_ssse3(rgb: &[u8], out: &mut [u8]) {
    let pixels = out.len();
    let mut i = 0;
    while i + 16 <= pixels {
        let (r, g, b) = deinterleave_16px(rgb.as_ptr().add(i * 3));
        let y = weighted_sum_128(r, g, b);
        _mm_storeu_si128(out.as_mut_ptr().add(i) as *mut __m128i, y);
        i += 16;
    }
    luma_row_scalar(&rgb[i * 3..], &mut out[i..]);
}

/// AVX2: 32 pixels per iteration; two SSSE3 deinterleaves feeding 256-bit
/// arithmetic.
///
/// # Safety
/// Caller must ensure AVX2 is supported and `rgb.len() == out.len() * 3`.
#[target_feature(enable = "avx2")]
pub unsafe fn luma_row_avx2(rgb: &[u8], out: &mut [u8]) {
    let pixels = out.len();
    let wr = _mm256_set1_epi16(R_WEIGHT as i16);
    let wg = _mm256_set1_epi16(G_WEIGHT as i16);
    let wb = _mm256_set1_epi16(B_WEIGHT as i16);

    let mut i = 0;
    while i + 32 <= pixels {
        let (r0, g0, b0) = deinterleave_16px(rgb.as_ptr().add(i * 3));
        let (r1, g1, b1) = deinterleave_16px(rgb.as_ptr().add((i + 16) * 3));

        let y0 = _mm256_srli_epi16(
            _mm256_add_epi16(
                _mm256_add_epi16(
                    _mm256_mullo_epi16(_mm256_cvtepu8_epi16(r0), wr),
                    _mm256_mullo_epi16(_mm256_cvtepu8_epi16(g0), wg),
                ),
                _mm256_mullo_epi16(_mm256_cvtepu8_epi16(b0), wb),
            ),
            8,
        );
        let y1 = _mm256_srli_epi16(
            _mm256_add_epi16(
                _mm256_add_epi16(
                    _mm256_mullo_epi16(_mm256_cvtepu8_epi16(r1), wr),
                    _mm256_mullo_epi16(_mm256_cvtepu8_epi16(g1), wg),
                ),
                _mm256_mullo_epi16(_mm256_cvtepu8_epi16(b1), wb),
            ),
            8,
        );

        // packus interleaves 128-bit lanes; permute restores pixel order.
        let packed = _mm256_packus_epi16(y0, y1);
        let ordered = _mm256_permute4x64_epi64(packed, 0b1101_1000);
        _mm256_storeu_si256(out.as_mut_ptr().add(i) as *mut __m256i, ordered);
        i += 32;
    }
    luma_row_scalar(&rgb[i * 3..], &mut out[i..]);
}
