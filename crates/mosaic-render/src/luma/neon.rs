//! AArch64 NEON luminance path.

#![allow(unsafe_op_in_unsafe_fn)]

use core::arch::aarch64::*;

use super::{luma_row_scalar, B_WEIGHT, G_WEIGHT, R_WEIGHT};

/// NEON: 16 pixels per iteration. `vld3q_u8` deinterleaves the RGB
/// stream for free; widening multiply-accumulate keeps the arithmetic in
/// u16 like the scalar reference.
///
/// # Safety
/// Caller must ensure NEON is available (baseline on aarch64) and
/// `rgb.len() == out.len() * 3`.
#[target_feature(enable = "neon")]
pub unsafe fn luma_row_neon(rgb: &[u8], out: &mut [u8]) {
    let pixels = out.len();
    let wr = vdup_n_u8(R_WEIGHT as u8);
    let wg = vdup_n_u8(G_WEIGHT as u8);
    let wb = vdup_n_u8(B_WEIGHT as u8);

    let mut i = 0;
    while i + 16 <= pixels {
        let planes = vld3q_u8(rgb.as_ptr().add(i * 3));
        let (r, g, b) = (planes.0, planes.1, planes.2);

        let mut lo = vmull_u8(vget_low_u8(r), wr);
        lo = vmlal_u8(lo, vget_low_u8(g), wg);
        lo = vmlal_u8(lo, vget_low_u8(b), wb);

        let mut hi = vmull_u8(vget_high_u8(r), wr);
        hi = vmlal_u8(hi, vget_high_u8(g), wg);
        hi = vmlal_u8(hi, vget_high_u8(b), wb);

        let y = vcombine_u8(vshrn_n_u16(lo, 8), vshrn_n_u16(hi, 8));
        vst1q_u8(out.as_mut_ptr().add(i), y);
        i += 16;
    }
    luma_row_scalar(&rgb[i * 3..], &mut out[i..]);
}
