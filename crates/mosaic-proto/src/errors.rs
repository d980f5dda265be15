//! Error types for the wire layer.

use thiserror::Error;

/// Errors from packet framing and deframing.
///
/// Every variant here is fatal to the connection it occurred on: once the
/// byte stream is out of sync there is no way to resynchronize a framed
/// TCP stream, so the caller must close the socket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("bad magic: expected {expected:#010x}, got {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("unsupported protocol version {found} (supported: {supported})")]
    UnsupportedVersion { supported: u8, found: u8 },

    #[error("payload length {len} exceeds limit {max}")]
    OversizedPayload { len: u32, max: u32 },

    #[error("stream truncated mid-packet")]
    Truncated,

    #[error("crc mismatch: header says {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch { expected: u32, computed: u32 },
}

impl WireError {
    /// Stable identifier for user-visible reporting.
    pub fn stable_code(&self) -> &'static str {
        match self {
            WireError::BadMagic { .. } => "E_PROTO_BAD_MAGIC",
            WireError::UnsupportedVersion { .. } => "E_PROTO_BAD_VERSION",
            WireError::OversizedPayload { .. } => "E_PROTO_OVERSIZED",
            WireError::Truncated => "E_PROTO_TRUNCATED",
            WireError::CrcMismatch { .. } => "E_PROTO_CRC",
        }
    }
}

/// Errors from message body encoding/decoding.
///
/// Unlike [`WireError`], a malformed body inside a well-framed packet is
/// recoverable: the packet can be dropped without closing the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message body truncated (needed {needed} more bytes)")]
    Truncated { needed: usize },

    #[error("invalid field: {0}")]
    BadField(&'static str),

    #[error("display name exceeds {max} bytes")]
    NameTooLong { max: usize },

    #[error("string field is not valid UTF-8")]
    BadUtf8,
}
