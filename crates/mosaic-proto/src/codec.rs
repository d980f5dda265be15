//! Packet encoder/decoder over blocking byte streams.

use std::io::{self, Read, Write};

use crate::errors::WireError;
use crate::wire::{Packet, PacketHeader, HEADER_LEN};

/// Serialize a packet: header (with computed CRC) followed by payload.
///
/// The CRC is IEEE CRC-32 over the header with its CRC field zeroed,
/// concatenated with the payload exactly as passed in. Callers sealing
/// payloads must therefore seal first and encode second.
pub fn encode(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_into(header, payload, &mut out);
    out
}

/// Like [`encode`] but appends to a caller-owned buffer (reused across
/// frames on the hot send path).
pub fn encode_into(header: &PacketHeader, payload: &[u8], out: &mut Vec<u8>) {
    let mut hdr = *header;
    hdr.payload_len = payload.len() as u32;
    let mut bytes = hdr.aad_bytes();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes);
    hasher.update(payload);
    let crc = hasher.finalize();
    bytes[28..32].copy_from_slice(&crc.to_be_bytes());

    out.extend_from_slice(&bytes);
    out.extend_from_slice(payload);
}

/// Read one packet from `stream`, enforcing `max_payload`.
///
/// Blocks until a full packet (or EOF/timeout, surfaced as `Err(io)`) is
/// available. CRC and length violations return `Ok(Err(WireError))` so the
/// caller can distinguish stream death from protocol violations.
pub fn decode_from<R: Read>(
    stream: &mut R,
    max_payload: u32,
) -> io::Result<Result<Packet, WireError>> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    if let Err(e) = read_exact_or_truncated(stream, &mut hdr_buf) {
        return match e {
            ReadError::Io(io) => Err(io),
            ReadError::Eof => Ok(Err(WireError::Truncated)),
        };
    }

    let header = match PacketHeader::parse(&hdr_buf) {
        Ok(h) => h,
        Err(e) => return Ok(Err(e)),
    };

    if header.payload_len > max_payload {
        return Ok(Err(WireError::OversizedPayload {
            len: header.payload_len,
            max: max_payload,
        }));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    if let Err(e) = read_exact_or_truncated(stream, &mut payload) {
        return match e {
            ReadError::Io(io) => Err(io),
            ReadError::Eof => Ok(Err(WireError::Truncated)),
        };
    }

    let mut zeroed = hdr_buf;
    zeroed[28..32].copy_from_slice(&[0, 0, 0, 0]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&zeroed);
    hasher.update(&payload);
    let computed = hasher.finalize();
    if computed != header.crc32 {
        return Ok(Err(WireError::CrcMismatch {
            expected: header.crc32,
            computed,
        }));
    }

    Ok(Ok(Packet { header, payload }))
}

/// Write one packet to `stream` as a single buffered write.
pub fn write_to<W: Write>(stream: &mut W, header: &PacketHeader, payload: &[u8]) -> io::Result<()> {
    let bytes = encode(header, payload);
    stream.write_all(&bytes)
}

enum ReadError {
    Io(io::Error),
    Eof,
}

// Distinguishes a clean EOF at a packet boundary from one mid-packet; both
// end the connection but the latter is a protocol-level truncation.
fn read_exact_or_truncated<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<(), ReadError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(ReadError::Eof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReadError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{PacketFlags, PacketType, DEFAULT_MAX_PAYLOAD};
    use std::io::Cursor;

    fn header(payload: &[u8]) -> PacketHeader {
        let mut h = PacketHeader::new(PacketType::VideoFrame, PacketFlags::empty(), 3, 11);
        h.payload_len = payload.len() as u32;
        h
    }

    #[test]
    fn encode_decode_round_trip() {
        let payload = b"frame bytes".to_vec();
        let bytes = encode(&header(&payload), &payload);
        let mut cur = Cursor::new(bytes);
        let pkt = decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(pkt.header.typ(), Some(PacketType::VideoFrame));
        assert_eq!(pkt.header.client_id, 3);
        assert_eq!(pkt.header.seq, 11);
        assert_eq!(pkt.payload, payload);
    }

    #[test]
    fn empty_payload_round_trips() {
        let bytes = encode(&header(&[]), &[]);
        assert_eq!(bytes.len(), HEADER_LEN);
        let mut cur = Cursor::new(bytes);
        let pkt = decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(pkt.payload.len(), 0);
    }

    #[test]
    fn max_payload_accepted_max_plus_one_rejected() {
        let max = 64u32;
        let payload = vec![0xAB; 64];
        let bytes = encode(&header(&payload), &payload);
        let mut cur = Cursor::new(bytes);
        assert!(decode_from(&mut cur, max).unwrap().is_ok());

        let payload = vec![0xAB; 65];
        let bytes = encode(&header(&payload), &payload);
        let mut cur = Cursor::new(bytes);
        assert!(matches!(
            decode_from(&mut cur, max).unwrap(),
            Err(WireError::OversizedPayload { len: 65, max: 64 })
        ));
    }

    #[test]
    fn corrupt_payload_fails_crc() {
        let payload = b"payload".to_vec();
        let mut bytes = encode(&header(&payload), &payload);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let mut cur = Cursor::new(bytes);
        assert!(matches!(
            decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap(),
            Err(WireError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_header_field_fails_crc() {
        let payload = b"payload".to_vec();
        let mut bytes = encode(&header(&payload), &payload);
        bytes[16] ^= 0x01; // seq
        let mut cur = Cursor::new(bytes);
        assert!(matches!(
            decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap(),
            Err(WireError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn short_stream_is_truncated() {
        let payload = b"payload".to_vec();
        let bytes = encode(&header(&payload), &payload);
        let mut cur = Cursor::new(bytes[..bytes.len() - 3].to_vec());
        assert!(matches!(
            decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap(),
            Err(WireError::Truncated)
        ));

        // EOF inside the header reads the same way
        let mut cur = Cursor::new(bytes[..10].to_vec());
        assert!(matches!(
            decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap(),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn two_packets_back_to_back() {
        let a = b"first".to_vec();
        let b = b"second!".to_vec();
        let mut bytes = encode(&header(&a), &a);
        bytes.extend_from_slice(&encode(&header(&b), &b));
        let mut cur = Cursor::new(bytes);
        let p1 = decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let p2 = decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(p1.payload, a);
        assert_eq!(p2.payload, b);
    }
}
