//! Unified error taxonomy.
//!
//! Per-module error enums live next to their code; this module folds them
//! into one [`CoreError`] with the propagation policy attached: whether a
//! failure is local to a packet, fatal to one connection, or fatal to the
//! process, plus the stable identifier and exit code surfaced to users.

use std::io;

use thiserror::Error;

use mosaic_crypto::keyfile::KeyFileError;
use mosaic_crypto::known_hosts::KnownHostsError;
use mosaic_crypto::password::PasswordError;
use mosaic_crypto::session::SessionCryptoError;
use mosaic_proto::{MessageError, WireError};

use crate::compress::CompressError;
use crate::config::ConfigError;
use crate::handshake::HandshakeError;
use crate::queue::QueueError;
use crate::registry::RegistryError;

/// How far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log and drop the packet; the connection continues.
    Packet,
    /// Close the connection; the process continues.
    Connection,
    /// The process cannot continue.
    Process,
}

/// Process exit codes (§6 of the protocol description).
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 2;
    pub const NETWORK: i32 = 3;
    pub const CRYPTO: i32 = 4;
    pub const CAPTURE: i32 = 5;
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol: {0}")]
    Wire(#[from] WireError),

    #[error("protocol: {0}")]
    Message(#[from] MessageError),

    #[error("crypto: {0}")]
    Crypto(#[from] SessionCryptoError),

    #[error("crypto: {0}")]
    KnownHosts(#[from] KnownHostsError),

    #[error("crypto: {0}")]
    Password(#[from] PasswordError),

    #[error("config: {0}")]
    KeyFile(#[from] KeyFileError),

    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("compress: {0}")]
    Compress(#[from] CompressError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("capture: {0}")]
    Capture(String),
}

impl CoreError {
    /// Stable identifier for single-line user-visible reporting.
    pub fn stable_code(&self) -> &'static str {
        match self {
            CoreError::Wire(e) => e.stable_code(),
            CoreError::Message(_) => "E_PROTO_BAD_MESSAGE",
            CoreError::Crypto(e) => e.stable_code(),
            CoreError::KnownHosts(e) => e.stable_code(),
            CoreError::Password(e) => e.stable_code(),
            CoreError::KeyFile(e) => e.stable_code(),
            CoreError::Handshake(e) => e.stable_code(),
            CoreError::Queue(e) => e.stable_code(),
            CoreError::Compress(e) => e.stable_code(),
            CoreError::Registry(e) => e.stable_code(),
            CoreError::Config(e) => e.stable_code(),
            CoreError::Io(_) => "E_IO",
            CoreError::Capture(_) => "E_CAPTURE",
        }
    }

    /// Propagation policy for this error.
    pub fn severity(&self) -> Severity {
        match self {
            // Replay and length mismatches are per-packet; other crypto
            // failures kill the connection.
            CoreError::Crypto(e) if !e.is_fatal() => Severity::Packet,
            CoreError::Crypto(_) => Severity::Connection,
            // A body that does not parse is dropped; the framing is intact.
            CoreError::Message(_) => Severity::Packet,
            // Oversized decompression output is a per-packet resource error.
            CoreError::Compress(_) => Severity::Packet,
            CoreError::Queue(_) => Severity::Packet,
            CoreError::Wire(_) | CoreError::Handshake(_) | CoreError::Io(_) => {
                Severity::Connection
            }
            CoreError::Registry(_) => Severity::Connection,
            CoreError::KnownHosts(_)
            | CoreError::Password(_)
            | CoreError::KeyFile(_)
            | CoreError::Config(_)
            | CoreError::Capture(_) => Severity::Process,
        }
    }

    /// Exit code when this error ends the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Config(_) | CoreError::KeyFile(_) => exit_codes::CONFIG,
            CoreError::Io(_) | CoreError::Wire(_) | CoreError::Message(_) | CoreError::Queue(_) => {
                exit_codes::NETWORK
            }
            CoreError::Crypto(_)
            | CoreError::KnownHosts(_)
            | CoreError::Password(_)
            | CoreError::Handshake(_) => exit_codes::CRYPTO,
            CoreError::Capture(_) => exit_codes::CAPTURE,
            CoreError::Compress(_) | CoreError::Registry(_) => exit_codes::NETWORK,
        }
    }
}
