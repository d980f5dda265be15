//! Frame payload compression.
//!
//! Thin shim over zstd's bulk API. Small payloads are sent as-is; larger
//! ones are compressed only when that actually shrinks them (camera
//! frames of noise can grow). Decompression enforces an output bound so
//! a hostile peer cannot send a 4 KiB packet that inflates into gigabytes.

use thiserror::Error;
use tracing::trace;

/// Payloads below this many bytes are never compressed.
pub const COMPRESS_THRESHOLD: usize = 512;

/// A compressed payload may expand to at most this multiple of its wire
/// size (additionally capped by the connection's max frame bytes).
pub const MAX_EXPANSION: usize = 16;

/// Default zstd level; latency matters more than ratio here.
pub const DEFAULT_LEVEL: i32 = 1;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("decompression failed or exceeded the {bound}-byte bound")]
    Decompress { bound: usize },

    #[error("compression failed")]
    Compress,
}

impl CompressError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            CompressError::Decompress { .. } => "E_RESOURCE_DECOMPRESS",
            CompressError::Compress => "E_RESOURCE_COMPRESS",
        }
    }
}

/// Compress `payload` if it is worth it. Returns `None` when the payload
/// should ship uncompressed (below threshold, incompressible, or codec
/// failure — none of which are errors on the send path).
pub fn maybe_compress(payload: &[u8], level: i32) -> Option<Vec<u8>> {
    if payload.len() < COMPRESS_THRESHOLD {
        return None;
    }
    match zstd::bulk::compress(payload, level) {
        Ok(compressed) if compressed.len() < payload.len() => {
            trace!(raw = payload.len(), compressed = compressed.len(), "frame compressed");
            Some(compressed)
        }
        Ok(_) => None,
        Err(_) => None,
    }
}

/// Decompress a payload flagged `COMPRESSED`, bounding the output at
/// `min(MAX_EXPANSION * input, max_frame_bytes)`.
pub fn decompress(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, CompressError> {
    let bound = payload
        .len()
        .saturating_mul(MAX_EXPANSION)
        .min(max_frame_bytes);
    zstd::bulk::decompress(payload, bound).map_err(|_| CompressError::Decompress { bound })
}
