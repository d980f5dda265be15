//! Mosaic wire format.
//!
//! This crate owns everything that crosses a socket: the fixed 32-byte
//! packet header, CRC framing, length limits, and the fixed-layout
//! message bodies. It performs no I/O beyond `std::io::{Read, Write}`
//! adapters and no cryptography; sealing happens a layer above and this
//! crate treats sealed payloads as opaque bytes.

#![forbid(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod messages;
pub mod wire;

pub use codec::{decode_from, encode, encode_into};
pub use errors::{MessageError, WireError};
pub use wire::{Packet, PacketFlags, PacketHeader, PacketType};

#[cfg(test)]
mod proptests;
