//! ANSI SGR emission and 256-color quantization.

use std::io::Write;

/// Reset SGR emitted at the end of every colored row.
pub const SGR_RESET: &[u8] = b"\x1b[0m";

/// Cursor home + erase to end of screen; written once before the first
/// row of every frame paint to avoid flicker without a full clear.
pub const HOME_AND_CLEAR: &[u8] = b"\x1b[H\x1b[0J";

/// Worst-case SGR byte count for one cell in truecolor modes
/// (`ESC [ 48;2;255;255;255 m` = 19 bytes).
pub const MAX_SGR_TRUECOLOR: usize = 19;

/// Worst-case SGR byte count for one cell in 256-color modes
/// (`ESC [ 48;5;255 m` = 11 bytes).
pub const MAX_SGR_256: usize = 11;

pub fn push_sgr_true(out: &mut Vec<u8>, background: bool, rgb: [u8; 3]) {
    let layer = if background { 48 } else { 38 };
    // Vec<u8> writes cannot fail.
    let _ = write!(out, "\x1b[{};2;{};{};{}m", layer, rgb[0], rgb[1], rgb[2]);
}

pub fn push_sgr_256(out: &mut Vec<u8>, background: bool, index: u8) {
    let layer = if background { 48 } else { 38 };
    let _ = write!(out, "\x1b[{};5;{}m", layer, index);
}

/// Quantizer into the xterm 256-color palette: the 6x6x6 cube plus the
/// 24-step gray ramp, via a 512-entry LUT over 3-bit-per-channel bins.
pub struct Palette256 {
    lut: [u8; 512],
}

// Channel values of the 6-level cube axis.
const CUBE_LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];

impl Palette256 {
    pub fn new() -> Self {
        let mut lut = [0u8; 512];
        for bin in 0..512 {
            // Bin centers: 3-bit channel value v covers [v*32, v*32+31].
            let r = (((bin >> 6) & 7) * 32 + 16) as u8;
            let g = (((bin >> 3) & 7) * 32 + 16) as u8;
            let b = ((bin & 7) * 32 + 16) as u8;
            lut[bin] = nearest_index(r, g, b);
        }
        Palette256 { lut }
    }

    /// Palette index for an RGB color (through the 3-bit bin LUT).
    #[inline]
    pub fn index(&self, rgb: [u8; 3]) -> u8 {
        let bin =
            ((rgb[0] as usize >> 5) << 6) | ((rgb[1] as usize >> 5) << 3) | (rgb[2] as usize >> 5);
        self.lut[bin]
    }
}

impl Default for Palette256 {
    fn default() -> Self {
        Self::new()
    }
}

fn nearest_index(r: u8, g: u8, b: u8) -> u8 {
    let mut best = 0u8;
    let mut best_dist = u32::MAX;

    // Cube entries 16..=231.
    for (ri, &rl) in CUBE_LEVELS.iter().enumerate() {
        for (gi, &gl) in CUBE_LEVELS.iter().enumerate() {
            for (bi, &bl) in CUBE_LEVELS.iter().enumerate() {
                let d = dist(r, g, b, rl, gl, bl);
                if d < best_dist {
                    best_dist = d;
                    best = (16 + 36 * ri + 6 * gi + bi) as u8;
                }
            }
        }
    }

    // Gray ramp entries 232..=255: levels 8, 18, ... 238.
    for k in 0..24u32 {
        let level = (8 + 10 * k) as u8;
        let d = dist(r, g, b, level, level, level);
        if d < best_dist {
            best_dist = d;
            best = (232 + k) as u8;
        }
    }
    best
}

#[inline]
fn dist(r: u8, g: u8, b: u8, pr: u8, pg: u8, pb: u8) -> u32 {
    let dr = r as i32 - pr as i32;
    let dg = g as i32 - pg as i32;
    let db = b as i32 - pb as i32;
    (dr * dr + dg * dg + db * db) as u32
}
