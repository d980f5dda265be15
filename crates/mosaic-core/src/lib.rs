//! Mosaic session logic.
//!
//! Everything between the wire (mosaic-proto / mosaic-crypto) and the
//! binaries: the handshake state machines for both peers, the slotted
//! client registry, bounded per-lane queues with overflow policies, the
//! compression shim, configuration, and the unified error taxonomy.

#![forbid(unsafe_code)]

pub mod channel;
pub mod compress;
pub mod config;
pub mod errors;
pub mod handshake;
pub mod queue;
pub mod registry;

pub use config::Config;
pub use errors::CoreError;
