//! Audio mixing for Mosaic.
//!
//! N mono float32 sources at a common sample rate go in, one mixed bus
//! comes out. Per-source envelope followers drive a leader/ducking stage,
//! a crowd-scaling gain keeps large rooms from stacking up, and a
//! soft-knee bus compressor plus a hard clamp bound the result in
//! [-1, 1]. Everything is a single pass per sample; there is no lookahead
//! and no FFT, so the mixer is exactly time-invariant.

#![forbid(unsafe_code)]

pub mod dynamics;
pub mod envelope;
pub mod mixer;

pub use dynamics::{BusCompressor, CompressorParams};
pub use envelope::EnvelopeFollower;
pub use mixer::{Mixer, MixerParams};

/// Linear amplitude for a dB value.
pub fn db_to_lin(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// dB for a linear amplitude, floored to avoid -inf on silence.
pub fn lin_to_db(lin: f32) -> f32 {
    20.0 * lin.max(1e-9).log10()
}
