//! Packet header definition.
//!
//! The header is a fixed 32-byte structure serialized big-endian:
//!
//! ```text
//! offset  field        size
//!      0  magic        u32   0xA5C11CA7
//!      4  version      u8    1
//!      5  reserved     u8    0
//!      6  type         u16
//!      8  flags        u16
//!     10  reserved     u16   0
//!     12  client_id    u32
//!     16  seq          u64
//!     24  payload_len  u32
//!     28  crc32        u32   IEEE, over header-with-crc-zeroed ++ payload
//! ```
//!
//! The payload follows immediately. When the session is sealed the payload
//! is ciphertext (including the 16-byte AEAD tag) and `payload_len` refers
//! to the ciphertext length; the CRC always covers the bytes actually on
//! the wire.

use crate::errors::WireError;

/// Protocol magic: identifies a Mosaic stream.
pub const MAGIC: u32 = 0xA5C1_1CA7;

/// Current protocol version.
pub const VERSION: u8 = 1;

/// Serialized header size in bytes.
pub const HEADER_LEN: usize = 32;

/// Default cap on `payload_len`. Configurable per connection, never above
/// this at the codec layer unless the caller raises it explicitly.
pub const DEFAULT_MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

/// Packet types. The set is closed; unknown values survive decoding so the
/// receiver can apply the non-fatal-skip rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Hello = 1,
    ServerHello = 2,
    AuthRequest = 3,
    AuthChallenge = 4,
    AuthResponse = 5,
    SessionEstablished = 6,
    Capabilities = 7,
    VideoFrame = 8,
    AudioBatch = 9,
    Ping = 10,
    Pong = 11,
    ClientJoin = 12,
    ClientLeave = 13,
    GridLayout = 14,
    Error = 15,
    Close = 16,
}

impl PacketType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => PacketType::Hello,
            2 => PacketType::ServerHello,
            3 => PacketType::AuthRequest,
            4 => PacketType::AuthChallenge,
            5 => PacketType::AuthResponse,
            6 => PacketType::SessionEstablished,
            7 => PacketType::Capabilities,
            8 => PacketType::VideoFrame,
            9 => PacketType::AudioBatch,
            10 => PacketType::Ping,
            11 => PacketType::Pong,
            12 => PacketType::ClientJoin,
            13 => PacketType::ClientLeave,
            14 => PacketType::GridLayout,
            15 => PacketType::Error,
            16 => PacketType::Close,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(pub u16);

impl PacketFlags {
    /// Receiver may skip this packet instead of closing on unknown type.
    pub const NON_FATAL: u16 = 0x0001;
    /// Payload is compressed (before sealing).
    pub const COMPRESSED: u16 = 0x0002;
    /// Payload is AEAD ciphertext.
    pub const SEALED: u16 = 0x0004;

    pub fn empty() -> Self {
        PacketFlags(0)
    }

    pub fn with(self, bit: u16) -> Self {
        PacketFlags(self.0 | bit)
    }

    pub fn non_fatal(self) -> bool {
        self.0 & Self::NON_FATAL != 0
    }

    pub fn compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn sealed(self) -> bool {
        self.0 & Self::SEALED != 0
    }
}

/// Parsed packet header.
///
/// `packet_type` is kept raw so that unknown types survive decoding;
/// [`PacketHeader::typ`] resolves it against the closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u16,
    pub flags: PacketFlags,
    pub client_id: u32,
    pub seq: u64,
    pub payload_len: u32,
    pub crc32: u32,
}

impl PacketHeader {
    pub fn new(typ: PacketType, flags: PacketFlags, client_id: u32, seq: u64) -> Self {
        PacketHeader {
            packet_type: typ.as_u16(),
            flags,
            client_id,
            seq,
            payload_len: 0,
            crc32: 0,
        }
    }

    /// Resolve the raw type against the closed set.
    pub fn typ(&self) -> Option<PacketType> {
        PacketType::from_u16(self.packet_type)
    }

    /// Serialize with the CRC field forced to zero.
    ///
    /// This form doubles as the AEAD associated data for sealed payloads:
    /// both peers compute it identically before the real CRC is known.
    pub fn aad_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        out[4] = VERSION;
        out[5] = 0;
        out[6..8].copy_from_slice(&self.packet_type.to_be_bytes());
        out[8..10].copy_from_slice(&self.flags.0.to_be_bytes());
        out[10..12].copy_from_slice(&0u16.to_be_bytes());
        out[12..16].copy_from_slice(&self.client_id.to_be_bytes());
        out[16..24].copy_from_slice(&self.seq.to_be_bytes());
        out[24..28].copy_from_slice(&self.payload_len.to_be_bytes());
        // bytes 28..32 stay zero
        out
    }

    /// Parse a 32-byte header. Validates magic and version only; length
    /// and CRC checks happen in the codec where the limit and payload are
    /// in hand.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, WireError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(WireError::BadMagic { expected: MAGIC, found: magic });
        }
        if buf[4] != VERSION {
            return Err(WireError::UnsupportedVersion { supported: VERSION, found: buf[4] });
        }
        Ok(PacketHeader {
            packet_type: u16::from_be_bytes([buf[6], buf[7]]),
            flags: PacketFlags(u16::from_be_bytes([buf[8], buf[9]])),
            client_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            seq: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
            payload_len: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
            crc32: u32::from_be_bytes([buf[28], buf[29], buf[30], buf[31]]),
        })
    }
}

/// A decoded packet: header plus payload bytes as they appeared on the
/// wire (ciphertext if sealed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_round_trip_covers_closed_set() {
        for raw in 1..=16u16 {
            let typ = PacketType::from_u16(raw).expect("closed set");
            assert_eq!(typ.as_u16(), raw);
        }
        assert_eq!(PacketType::from_u16(0), None);
        assert_eq!(PacketType::from_u16(17), None);
        assert_eq!(PacketType::from_u16(0xFFFF), None);
    }

    #[test]
    fn flags_accessors() {
        let f = PacketFlags::empty()
            .with(PacketFlags::COMPRESSED)
            .with(PacketFlags::SEALED);
        assert!(f.compressed());
        assert!(f.sealed());
        assert!(!f.non_fatal());
    }

    #[test]
    fn aad_bytes_layout() {
        let mut h = PacketHeader::new(PacketType::VideoFrame, PacketFlags(0x0006), 7, 42);
        h.payload_len = 0x1234;
        let aad = h.aad_bytes();
        assert_eq!(&aad[0..4], &MAGIC.to_be_bytes());
        assert_eq!(aad[4], VERSION);
        assert_eq!(&aad[6..8], &8u16.to_be_bytes());
        assert_eq!(&aad[8..10], &0x0006u16.to_be_bytes());
        assert_eq!(&aad[12..16], &7u32.to_be_bytes());
        assert_eq!(&aad[16..24], &42u64.to_be_bytes());
        assert_eq!(&aad[24..28], &0x1234u32.to_be_bytes());
        assert_eq!(&aad[28..32], &[0, 0, 0, 0]);
    }

    #[test]
    fn parse_rejects_bad_magic_and_version() {
        let h = PacketHeader::new(PacketType::Ping, PacketFlags::empty(), 1, 1);
        let mut buf = h.aad_bytes();
        buf[0] ^= 0xFF;
        assert!(matches!(
            PacketHeader::parse(&buf),
            Err(WireError::BadMagic { .. })
        ));

        let mut buf = h.aad_bytes();
        buf[4] = 9;
        assert!(matches!(
            PacketHeader::parse(&buf),
            Err(WireError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn unknown_type_survives_parse() {
        let mut h = PacketHeader::new(PacketType::Ping, PacketFlags::empty(), 1, 1);
        h.packet_type = 999;
        let parsed = PacketHeader::parse(&h.aad_bytes()).unwrap();
        assert_eq!(parsed.packet_type, 999);
        assert_eq!(parsed.typ(), None);
    }
}
