//! Deterministic grid composition.
//!
//! Used by the server's composed-grid mode and by clients rendering
//! locally: cells are ordered by slot id, arranged into the smallest grid
//! with at least N cells, and letterboxed per cell over black.

use crate::image::RgbImage;
use crate::RenderError;

/// Smallest (rows, cols) grid holding `n` cells, biased wide because
/// terminal cells are taller than they are broad.
pub fn grid_dims(n: usize) -> (usize, usize) {
    if n == 0 {
        return (1, 1);
    }
    let cols = (n as f64).sqrt().ceil() as usize;
    let rows = n.div_ceil(cols);
    (rows, cols)
}

/// Compose `cells` into one frame of `width`x`height` pixels.
///
/// `cells` pairs a slot id with that participant's latest frame; order of
/// the input does not matter, composition sorts by slot id. Empty input
/// yields a black frame.
pub fn compose_grid(
    cells: &[(u32, &RgbImage)],
    width: usize,
    height: usize,
) -> Result<RgbImage, RenderError> {
    let mut out = RgbImage::new(width, height)?;
    if cells.is_empty() {
        return Ok(out);
    }

    let mut ordered: Vec<&(u32, &RgbImage)> = cells.iter().collect();
    ordered.sort_by_key(|(slot, _)| *slot);

    let (rows, cols) = grid_dims(ordered.len());
    let cell_w = width / cols;
    let cell_h = height / rows;
    if cell_w == 0 || cell_h == 0 {
        return Err(RenderError::InvalidDimensions { width: cell_w, height: cell_h });
    }

    for (i, (_, frame)) in ordered.iter().enumerate() {
        let row = i / cols;
        let col = i % cols;
        let boxed = frame.fit(cell_w, cell_h, [0, 0, 0])?;
        out.blit(&boxed, col * cell_w, row * cell_h);
    }
    Ok(out)
}
