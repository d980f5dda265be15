//! The renderer: image in, terminal bytes out.

use crate::ansi::{
    push_sgr_256, push_sgr_true, Palette256, MAX_SGR_256, MAX_SGR_TRUECOLOR, SGR_RESET,
};
use crate::image::RgbImage;
use crate::luma::{self, LumaPath};
use crate::RenderError;

/// Default glyph ramp, darkest to brightest.
pub const DEFAULT_RAMP: &str = "   ...',:;clodxkO0KXNWM";

/// Output coloring mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mono,
    Fg256,
    Bg256,
    FgTrue,
    BgTrue,
}

impl Mode {
    fn is_true_color(self) -> bool {
        matches!(self, Mode::FgTrue | Mode::BgTrue)
    }

    fn is_256(self) -> bool {
        matches!(self, Mode::Fg256 | Mode::Bg256)
    }

    fn is_background(self) -> bool {
        matches!(self, Mode::Bg256 | Mode::BgTrue)
    }

    /// Worst-case SGR bytes per cell in this mode.
    pub fn max_sgr_bytes_per_cell(self) -> usize {
        match self {
            Mode::Mono => 0,
            Mode::Fg256 | Mode::Bg256 => MAX_SGR_256,
            Mode::FgTrue | Mode::BgTrue => MAX_SGR_TRUECOLOR,
        }
    }
}

/// Per-frame render parameters (terminal cell grid).
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub width: usize,
    pub height: usize,
    /// Fill the whole target instead of preserving aspect ratio.
    pub stretch: bool,
}

/// Converts RGB frames to glyph/ANSI lines.
///
/// Owns its output buffer and reuses it across ticks; one renderer per
/// render loop, not shared between threads.
pub struct Renderer {
    mode: Mode,
    glyphs: [u8; 256],
    palette: Option<Palette256>,
    path: LumaPath,
    luma_buf: Vec<u8>,
    out: Vec<u8>,
}

impl Renderer {
    /// Build a renderer. `force_scalar` pins the luminance loop to the
    /// reference implementation regardless of CPU features.
    pub fn new(mode: Mode, ramp: &str, force_scalar: bool) -> Result<Self, RenderError> {
        if ramp.is_empty() || !ramp.is_ascii() {
            return Err(RenderError::BadRamp);
        }
        let ramp_bytes = ramp.as_bytes();
        let mut glyphs = [0u8; 256];
        for (y, glyph) in glyphs.iter_mut().enumerate() {
            *glyph = ramp_bytes[y * ramp_bytes.len() / 256];
        }
        Ok(Renderer {
            mode,
            glyphs,
            palette: mode.is_256().then(Palette256::new),
            path: if force_scalar || cfg!(feature = "force-scalar") {
                LumaPath::Scalar
            } else {
                luma::detect()
            },
            luma_buf: Vec::new(),
            out: Vec::new(),
        })
    }

    /// The luminance path in use (for startup logging).
    pub fn path(&self) -> LumaPath {
        self.path
    }

    /// Lower bound the caller must provide to [`Renderer::render_into`]
    /// for a `width`x`height` target.
    pub fn required_capacity(&self, width: usize, height: usize) -> usize {
        let cell = 1 + self.mode.max_sgr_bytes_per_cell();
        let trailer = SGR_RESET.len() + 1;
        height * (width * cell + trailer)
    }

    /// Render into the internal pooled buffer and return it.
    pub fn render(&mut self, img: &RgbImage, opts: RenderOptions) -> Result<&[u8], RenderError> {
        self.render_internal(img, opts)?;
        Ok(&self.out)
    }

    /// Render into a caller-provided buffer; returns the byte count
    /// written. The buffer must hold at least
    /// [`Renderer::required_capacity`] bytes.
    pub fn render_into(
        &mut self,
        img: &RgbImage,
        opts: RenderOptions,
        out: &mut [u8],
    ) -> Result<usize, RenderError> {
        let needed = self.required_capacity(opts.width, opts.height);
        if out.len() < needed {
            return Err(RenderError::BufferOverflow { needed, have: out.len() });
        }
        self.render_internal(img, opts)?;
        out[..self.out.len()].copy_from_slice(&self.out);
        Ok(self.out.len())
    }

    fn render_internal(&mut self, img: &RgbImage, opts: RenderOptions) -> Result<(), RenderError> {
        let (width, height) = (opts.width, opts.height);
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidDimensions { width, height });
        }

        // Step 1: resize, letterboxing with blank cells unless stretched.
        let (fit_w, fit_h) = if opts.stretch {
            (width, height)
        } else {
            let scale =
                (width as f32 / img.width() as f32).min(height as f32 / img.height() as f32);
            (
                ((img.width() as f32 * scale) as usize).clamp(1, width),
                ((img.height() as f32 * scale) as usize).clamp(1, height),
            )
        };
        let resized = img.resize(fit_w, fit_h)?;

        let pad_left = (width - fit_w) / 2;
        let pad_right = width - fit_w - pad_left;
        let pad_top = (height - fit_h) / 2;
        let pad_bottom = height - fit_h - pad_top;

        self.out.clear();
        self.luma_buf.resize(fit_w, 0);

        for _ in 0..pad_top {
            self.blank_row(width);
        }
        for y in 0..fit_h {
            let row = resized.row(y);
            luma::luma_row(self.path, row, &mut self.luma_buf);
            self.out.extend(std::iter::repeat(b' ').take(pad_left));
            self.emit_row(row);
            if self.mode != Mode::Mono {
                self.out.extend_from_slice(SGR_RESET);
            }
            self.out.extend(std::iter::repeat(b' ').take(pad_right));
            self.out.push(b'\n');
        }
        for _ in 0..pad_bottom {
            self.blank_row(width);
        }
        Ok(())
    }

    fn blank_row(&mut self, width: usize) {
        self.out.extend(std::iter::repeat(b' ').take(width));
        self.out.push(b'\n');
    }

    // Steps 2-4: luminance is already in `luma_buf`; map glyphs and emit
    // SGRs run-length encoded against the previous cell in scan order.
    fn emit_row(&mut self, rgb_row: &[u8]) {
        match self.mode {
            Mode::Mono => {
                for &y in &self.luma_buf {
                    self.out.push(self.glyphs[y as usize]);
                }
            }
            Mode::FgTrue | Mode::BgTrue => {
                let background = self.mode.is_background();
                let mut last: Option<[u8; 3]> = None;
                for (x, &y) in self.luma_buf.iter().enumerate() {
                    let rgb = [rgb_row[x * 3], rgb_row[x * 3 + 1], rgb_row[x * 3 + 2]];
                    if last != Some(rgb) {
                        push_sgr_true(&mut self.out, background, rgb);
                        last = Some(rgb);
                    }
                    self.out.push(self.glyphs[y as usize]);
                }
            }
            Mode::Fg256 | Mode::Bg256 => {
                let background = self.mode.is_background();
                let palette = self.palette.as_ref().expect("palette built for 256 modes");
                let mut last: Option<u8> = None;
                for (x, &y) in self.luma_buf.iter().enumerate() {
                    let rgb = [rgb_row[x * 3], rgb_row[x * 3 + 1], rgb_row[x * 3 + 2]];
                    let idx = palette.index(rgb);
                    if last != Some(idx) {
                        push_sgr_256(&mut self.out, background, idx);
                        last = Some(idx);
                    }
                    self.out.push(self.glyphs[y as usize]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_4x2() -> RgbImage {
        let pixels: [[u8; 3]; 8] = [
            [0, 0, 0],
            [255, 255, 255],
            [255, 0, 0],
            [0, 255, 0],
            [0, 0, 255],
            [128, 128, 128],
            [255, 255, 0],
            [0, 255, 255],
        ];
        let mut data = Vec::new();
        for p in pixels {
            data.extend_from_slice(&p);
        }
        RgbImage::from_rgb24(4, 2, data).unwrap()
    }

    #[test]
    fn mono_two_glyph_ramp_thresholds_at_128() {
        // Identity-size render of the reference 4x2 image through the
        // two-glyph ramp: luminance < 128 maps to '@', >= 128 to ' '.
        let mut r = Renderer::new(Mode::Mono, "@ ", true).unwrap();
        let opts = RenderOptions { width: 4, height: 2, stretch: true };
        let out = r.render(&image_4x2(), opts).unwrap();
        assert_eq!(out, b"@ @ \n@   \n");
    }

    #[test]
    fn mono_default_ramp_endpoints() {
        let mut img = RgbImage::new(2, 1).unwrap();
        img.set_pixel(0, 0, [0, 0, 0]);
        img.set_pixel(1, 0, [255, 255, 255]);
        let mut r = Renderer::new(Mode::Mono, DEFAULT_RAMP, true).unwrap();
        let out = r
            .render(&img, RenderOptions { width: 2, height: 1, stretch: true })
            .unwrap();
        assert_eq!(out, b" M\n");
    }

    #[test]
    fn truecolor_rle_collapses_runs() {
        let mut img = RgbImage::new(4, 1).unwrap();
        for x in 0..4 {
            img.set_pixel(x, 0, if x < 3 { [200, 10, 10] } else { [10, 200, 10] });
        }
        let mut r = Renderer::new(Mode::FgTrue, "@", true).unwrap();
        let out = r
            .render(&img, RenderOptions { width: 4, height: 1, stretch: true })
            .unwrap();
        let text = String::from_utf8_lossy(out);
        // Two color runs: exactly two color SGRs plus the trailing reset.
        assert_eq!(text.matches("\x1b[38;2;").count(), 2);
        assert!(text.ends_with("\x1b[0m\n"));
    }

    #[test]
    fn bg_mode_uses_48() {
        let mut img = RgbImage::new(1, 1).unwrap();
        img.set_pixel(0, 0, [1, 2, 3]);
        let mut r = Renderer::new(Mode::BgTrue, "@", true).unwrap();
        let out = r
            .render(&img, RenderOptions { width: 1, height: 1, stretch: true })
            .unwrap();
        assert!(String::from_utf8_lossy(out).starts_with("\x1b[48;2;1;2;3m"));
    }

    #[test]
    fn indexed_mode_emits_palette_sgrs() {
        let mut img = RgbImage::new(2, 1).unwrap();
        img.set_pixel(0, 0, [255, 0, 0]);
        img.set_pixel(1, 0, [255, 0, 0]);
        let mut r = Renderer::new(Mode::Fg256, "@", true).unwrap();
        let out = r
            .render(&img, RenderOptions { width: 2, height: 1, stretch: true })
            .unwrap();
        let text = String::from_utf8_lossy(out);
        // One run, one 256-color SGR.
        assert_eq!(text.matches("\x1b[38;5;").count(), 1);
    }

    #[test]
    fn letterbox_pads_with_spaces() {
        // A 2x2 image into a 6x2 target: scale is limited by height, so
        // content is 2x2 with two columns of padding either side.
        let mut img = RgbImage::new(2, 2).unwrap();
        for y in 0..2 {
            for x in 0..2 {
                img.set_pixel(x, y, [255, 255, 255]);
            }
        }
        let mut r = Renderer::new(Mode::Mono, "@ ", true).unwrap();
        let out = r
            .render(&img, RenderOptions { width: 6, height: 2, stretch: false })
            .unwrap();
        // White renders as ' ' under this ramp, so the whole row is blank
        // but the width proves the padding: 2 + 2 + 2 columns.
        assert_eq!(out, b"      \n      \n");
    }

    #[test]
    fn render_into_checks_capacity() {
        let img = image_4x2();
        let mut r = Renderer::new(Mode::FgTrue, "@ ", true).unwrap();
        let opts = RenderOptions { width: 4, height: 2, stretch: true };

        let mut small = [0u8; 8];
        let err = r.render_into(&img, opts, &mut small).unwrap_err();
        assert!(matches!(err, RenderError::BufferOverflow { .. }));

        let mut big = vec![0u8; r.required_capacity(4, 2)];
        let n = r.render_into(&img, opts, &mut big).unwrap();
        assert!(n > 0 && n <= big.len());
    }

    #[test]
    fn zero_target_rejected() {
        let img = image_4x2();
        let mut r = Renderer::new(Mode::Mono, "@ ", true).unwrap();
        assert!(matches!(
            r.render(&img, RenderOptions { width: 0, height: 2, stretch: true }),
            Err(RenderError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn empty_or_non_ascii_ramp_rejected() {
        assert!(matches!(Renderer::new(Mode::Mono, "", true), Err(RenderError::BadRamp)));
        assert!(matches!(Renderer::new(Mode::Mono, "héllo", true), Err(RenderError::BadRamp)));
    }

    #[test]
    fn simd_and_scalar_render_identically() {
        // Full-pipeline check: the probed path and forced scalar must
        // agree byte for byte.
        let mut img = RgbImage::new(33, 7).unwrap();
        let mut v = 13u32;
        for y in 0..7 {
            for x in 0..33 {
                v = v.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                img.set_pixel(x, y, [(v >> 8) as u8, (v >> 16) as u8, (v >> 24) as u8]);
            }
        }
        let opts = RenderOptions { width: 33, height: 7, stretch: true };
        let mut fast = Renderer::new(Mode::Mono, DEFAULT_RAMP, false).unwrap();
        let mut scalar = Renderer::new(Mode::Mono, DEFAULT_RAMP, true).unwrap();
        let a = fast.render(&img, opts).unwrap().to_vec();
        let b = scalar.render(&img, opts).unwrap().to_vec();
        assert_eq!(a, b);
    }
}
