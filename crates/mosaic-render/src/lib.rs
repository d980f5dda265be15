//! ASCII rendering for Mosaic.
//!
//! Turns canonical RGB24 frames into terminal output: bilinear resize to
//! the target cell grid, integer luminance, glyph selection through a
//! 256-entry ramp table, and optional ANSI color with run-length SGR
//! encoding (truecolor or the 256-color cube).
//!
//! Luminance is the hot loop and has SSE2/SSSE3/AVX2 and NEON fast paths
//! selected by a runtime probe; every path produces byte-identical output
//! to the scalar reference, and the probe can be overridden to force
//! scalar. SIMD is an implementation detail of this crate: nothing else
//! in the workspace contains unsafe code.

pub mod ansi;
pub mod grid;
pub mod image;
pub mod luma;
pub mod render;

pub use image::RgbImage;
pub use luma::LumaPath;
pub use render::{Mode, RenderOptions, Renderer};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("output buffer too small: need {needed}, have {have}")]
    BufferOverflow { needed: usize, have: usize },

    #[error("glyph ramp must be non-empty ASCII")]
    BadRamp,
}

impl RenderError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            RenderError::InvalidDimensions { .. } => "E_RENDER_DIMENSIONS",
            RenderError::BufferOverflow { .. } => "E_RENDER_BUFFER",
            RenderError::BadRamp => "E_RENDER_RAMP",
        }
    }
}
