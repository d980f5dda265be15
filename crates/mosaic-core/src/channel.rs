//! Sealed packet channel over a blocking stream.
//!
//! Owns the per-direction sequence spaces: the writer allocates `seq` and
//! seals, the reader verifies and opens. Handshake packets travel
//! unsealed through the same counters, so the first sealed packet simply
//! continues the sequence its direction was already on.

use std::io::{Read, Write};

use tracing::trace;

use mosaic_crypto::session::{OpenKey, SealKey, TAG_LEN};
use mosaic_proto::codec;
use mosaic_proto::{Packet, PacketFlags, PacketHeader, PacketType};

use crate::errors::CoreError;

/// Sending half. One per connection direction, owned by the writer
/// thread.
pub struct PacketWriter<W> {
    stream: W,
    seal: Option<SealKey>,
    next_seq: u64,
    client_id: u32,
    buf: Vec<u8>,
}

impl<W: Write> PacketWriter<W> {
    pub fn new(stream: W) -> Self {
        PacketWriter { stream, seal: None, next_seq: 1, client_id: 0, buf: Vec::new() }
    }

    /// Install the sealing key; everything sent afterwards is encrypted.
    pub fn enable_sealing(&mut self, seal: SealKey) {
        self.seal = Some(seal);
    }

    /// Set the client id stamped into outgoing headers (the sender's own
    /// slot, or the origin slot for forwarded media).
    pub fn set_client_id(&mut self, client_id: u32) {
        self.client_id = client_id;
    }

    pub fn is_sealing(&self) -> bool {
        self.seal.is_some()
    }

    /// Send one packet. `origin` overrides the header client id when
    /// forwarding another participant's media.
    pub fn send_from(
        &mut self,
        origin: u32,
        typ: PacketType,
        mut flags: PacketFlags,
        payload: &[u8],
    ) -> Result<(), CoreError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut header = PacketHeader::new(typ, flags, origin, seq);
        self.buf.clear();
        match &self.seal {
            None => {
                header.payload_len = payload.len() as u32;
                codec::encode_into(&header, payload, &mut self.buf);
            }
            Some(seal) => {
                flags = flags.with(PacketFlags::SEALED);
                header.flags = flags;
                header.payload_len = (payload.len() + TAG_LEN) as u32;
                let aad = header.aad_bytes();
                let ciphertext = seal.seal(seq, &aad, payload)?;
                codec::encode_into(&header, &ciphertext, &mut self.buf);
            }
        }
        self.stream.write_all(&self.buf)?;
        trace!(seq, ?typ, len = payload.len(), "packet sent");
        Ok(())
    }

    pub fn send(&mut self, typ: PacketType, flags: PacketFlags, payload: &[u8]) -> Result<(), CoreError> {
        self.send_from(self.client_id, typ, flags, payload)
    }

    pub fn flush(&mut self) -> Result<(), CoreError> {
        self.stream.flush()?;
        Ok(())
    }
}

/// Receiving half. One per connection direction, owned by the reader
/// thread.
pub struct PacketReader<R> {
    stream: R,
    open: Option<OpenKey>,
    max_payload: u32,
}

impl<R: Read> PacketReader<R> {
    pub fn new(stream: R, max_payload: u32) -> Self {
        PacketReader { stream, open: None, max_payload }
    }

    /// Install the opening key; sealed packets are required afterwards.
    pub fn enable_opening(&mut self, open: OpenKey) {
        self.open = Some(open);
    }

    pub fn is_opening(&self) -> bool {
        self.open.is_some()
    }

    /// Read one packet, decrypting sealed payloads in place.
    ///
    /// Io errors (including read timeouts) surface as `CoreError::Io`;
    /// protocol and crypto failures carry their own severities.
    pub fn recv(&mut self) -> Result<Packet, CoreError> {
        let mut packet = match codec::decode_from(&mut self.stream, self.max_payload)? {
            Ok(p) => p,
            Err(wire) => return Err(wire.into()),
        };

        if packet.header.flags.sealed() {
            let open = self
                .open
                .as_mut()
                .ok_or(CoreError::Crypto(mosaic_crypto::session::SessionCryptoError::DecryptFailed))?;
            let aad = packet.header.aad_bytes();
            let plaintext = open.open(packet.header.seq, &aad, &packet.payload)?;
            packet.payload = plaintext.to_vec();
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_crypto::session::{derive_session, Direction};
    use std::io::Cursor;

    fn keys() -> mosaic_crypto::session::SessionKeys {
        derive_session(&[0x33; 32], &[0x44; 32])
    }

    #[test]
    fn plain_then_sealed_share_one_sequence_space() {
        let mut wire = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut wire);
            writer.send(PacketType::Hello, PacketFlags::empty(), b"hello body").unwrap();
            writer.enable_sealing(SealKey::new(&keys().c2s, Direction::ClientToServer));
            writer.send(PacketType::Ping, PacketFlags::empty(), b"ping body").unwrap();
        }

        let mut reader = PacketReader::new(Cursor::new(wire), 1 << 20);
        let hello = reader.recv().unwrap();
        assert_eq!(hello.header.seq, 1);
        assert_eq!(hello.payload, b"hello body");
        assert!(!hello.header.flags.sealed());

        reader.enable_opening(OpenKey::new(&keys().c2s, Direction::ClientToServer));
        let ping = reader.recv().unwrap();
        assert_eq!(ping.header.seq, 2);
        assert!(ping.header.flags.sealed());
        assert_eq!(ping.payload, b"ping body");
    }

    #[test]
    fn replayed_bytes_surface_as_replay() {
        let mut wire = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut wire);
            writer.enable_sealing(SealKey::new(&keys().c2s, Direction::ClientToServer));
            writer.send(PacketType::Ping, PacketFlags::empty(), b"one").unwrap();
        }
        // The same frame twice on the wire.
        let mut doubled = wire.clone();
        doubled.extend_from_slice(&wire);

        let mut reader = PacketReader::new(Cursor::new(doubled), 1 << 20);
        reader.enable_opening(OpenKey::new(&keys().c2s, Direction::ClientToServer));
        assert!(reader.recv().is_ok());
        match reader.recv() {
            Err(CoreError::Crypto(e)) => {
                assert_eq!(e.stable_code(), "E_CRYPTO_REPLAY");
                assert!(!e.is_fatal());
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn sealed_packet_without_key_is_crypto_error() {
        let mut wire = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut wire);
            writer.enable_sealing(SealKey::new(&keys().c2s, Direction::ClientToServer));
            writer.send(PacketType::Ping, PacketFlags::empty(), b"x").unwrap();
        }
        let mut reader = PacketReader::new(Cursor::new(wire), 1 << 20);
        assert!(matches!(reader.recv(), Err(CoreError::Crypto(_))));
    }

    #[test]
    fn forwarded_media_keeps_origin_slot() {
        let mut wire = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut wire);
            writer.set_client_id(9);
            writer.send_from(4, PacketType::VideoFrame, PacketFlags::empty(), b"frame").unwrap();
        }
        let mut reader = PacketReader::new(Cursor::new(wire), 1 << 20);
        let pkt = reader.recv().unwrap();
        assert_eq!(pkt.header.client_id, 4);
    }
}
