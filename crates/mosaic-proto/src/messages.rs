//! Fixed-layout message bodies.
//!
//! Bodies are hand-framed big-endian structures: fixed fields first,
//! length-prefixed variable fields last. Media payloads (pixel/PCM data)
//! ride after the typed header fields and are returned as offsets into
//! the original buffer rather than copied.

use bytes::BufMut;

use crate::errors::MessageError;

pub const MAX_DISPLAY_NAME: usize = 32;

/// Color modes a client can render. Wire values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColorMode {
    Mono = 0,
    Fg256 = 1,
    Bg256 = 2,
    Fg24 = 3,
    Bg24 = 4,
}

impl ColorMode {
    pub fn from_u8(raw: u8) -> Result<Self, MessageError> {
        Ok(match raw {
            0 => ColorMode::Mono,
            1 => ColorMode::Fg256,
            2 => ColorMode::Bg256,
            3 => ColorMode::Fg24,
            4 => ColorMode::Bg24,
            _ => return Err(MessageError::BadField("color_mode")),
        })
    }
}

/// Pixel formats carried in VIDEO_FRAME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PixelFormat {
    Rgb24 = 0,
    Yuv420p = 1,
}

impl PixelFormat {
    pub fn from_u8(raw: u8) -> Result<Self, MessageError> {
        Ok(match raw {
            0 => PixelFormat::Rgb24,
            1 => PixelFormat::Yuv420p,
            _ => return Err(MessageError::BadField("pixel_format")),
        })
    }
}

/// Sample formats carried in AUDIO_BATCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleFormat {
    F32le = 0,
    S16le = 1,
}

impl SampleFormat {
    pub fn from_u8(raw: u8) -> Result<Self, MessageError> {
        Ok(match raw {
            0 => SampleFormat::F32le,
            1 => SampleFormat::S16le,
            _ => return Err(MessageError::BadField("sample_fmt")),
        })
    }
}

/// Capabilities advertised in HELLO and echoed in SESSION_ESTABLISHED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub color_mode: ColorMode,
    pub max_width: u16,
    pub max_height: u16,
    pub audio: bool,
}

impl Capabilities {
    pub const WIRE_LEN: usize = 6;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u8(self.color_mode as u8);
        out.put_u16(self.max_width);
        out.put_u16(self.max_height);
        out.put_u8(self.audio as u8);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, MessageError> {
        let color_mode = ColorMode::from_u8(r.u8()?)?;
        let max_width = r.u16()?;
        let max_height = r.u16()?;
        let audio = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(MessageError::BadField("audio")),
        };
        Ok(Capabilities { color_mode, max_width, max_height, audio })
    }
}

/// Client → server opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub identity_pk: [u8; 32],
    pub ephemeral_pk: [u8; 32],
    pub nonce: [u8; 32],
    pub caps: Capabilities,
    pub display_name: String,
}

impl Hello {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        if self.display_name.len() > MAX_DISPLAY_NAME {
            return Err(MessageError::NameTooLong { max: MAX_DISPLAY_NAME });
        }
        let mut out = Vec::with_capacity(96 + Capabilities::WIRE_LEN + 1 + self.display_name.len());
        out.extend_from_slice(&self.identity_pk);
        out.extend_from_slice(&self.ephemeral_pk);
        out.extend_from_slice(&self.nonce);
        self.caps.encode_into(&mut out);
        out.put_u8(self.display_name.len() as u8);
        out.extend_from_slice(self.display_name.as_bytes());
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        let identity_pk = r.array::<32>()?;
        let ephemeral_pk = r.array::<32>()?;
        let nonce = r.array::<32>()?;
        let caps = Capabilities::decode(&mut r)?;
        let name_len = r.u8()? as usize;
        if name_len > MAX_DISPLAY_NAME {
            return Err(MessageError::NameTooLong { max: MAX_DISPLAY_NAME });
        }
        let name = r.bytes(name_len)?;
        let display_name = std::str::from_utf8(name)
            .map_err(|_| MessageError::BadUtf8)?
            .to_owned();
        Ok(Hello { identity_pk, ephemeral_pk, nonce, caps, display_name })
    }
}

/// Server → client reply; `sig` is Ed25519 over the handshake transcript
/// hash up to and including this message's fixed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub identity_pk: [u8; 32],
    pub ephemeral_pk: [u8; 32],
    pub nonce: [u8; 32],
    pub password_required: bool,
    pub sig: [u8; 64],
}

impl ServerHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 32 + 32 + 1 + 64);
        out.extend_from_slice(&self.identity_pk);
        out.extend_from_slice(&self.ephemeral_pk);
        out.extend_from_slice(&self.nonce);
        out.put_u8(self.password_required as u8);
        out.extend_from_slice(&self.sig);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        let identity_pk = r.array::<32>()?;
        let ephemeral_pk = r.array::<32>()?;
        let nonce = r.array::<32>()?;
        let password_required = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(MessageError::BadField("password_required")),
        };
        let sig = r.array::<64>()?;
        Ok(ServerHello { identity_pk, ephemeral_pk, nonce, password_required, sig })
    }
}

/// bcrypt-pbkdf parameters for the optional password step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub salt: [u8; 16],
    pub rounds: u32,
}

impl AuthChallenge {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        out.extend_from_slice(&self.salt);
        out.put_u32(self.rounds);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        let salt = r.array::<16>()?;
        let rounds = r.u32()?;
        if rounds == 0 {
            return Err(MessageError::BadField("rounds"));
        }
        Ok(AuthChallenge { salt, rounds })
    }
}

/// HMAC over the transcript hash with the password-derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub mac: [u8; 32],
}

impl AuthResponse {
    pub fn encode(&self) -> Vec<u8> {
        self.mac.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        Ok(AuthResponse { mac: r.array::<32>()? })
    }
}

/// Server's final handshake message: the slot assigned to this client and
/// the negotiated capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablished {
    pub slot_id: u32,
    pub caps: Capabilities,
}

impl SessionEstablished {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + Capabilities::WIRE_LEN);
        out.put_u32(self.slot_id);
        self.caps.encode_into(&mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        let slot_id = r.u32()?;
        let caps = Capabilities::decode(&mut r)?;
        Ok(SessionEstablished { slot_id, caps })
    }
}

/// Typed fields of a VIDEO_FRAME; pixel bytes follow at `payload_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrameHeader {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub pts_ns: u64,
}

impl VideoFrameHeader {
    pub const WIRE_LEN: usize = 13;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u16(self.width);
        out.put_u16(self.height);
        out.put_u8(self.pixel_format as u8);
        out.put_u64(self.pts_ns);
    }

    /// Returns the header and the offset where pixel data begins.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), MessageError> {
        let mut r = Reader::new(buf);
        let width = r.u16()?;
        let height = r.u16()?;
        let pixel_format = PixelFormat::from_u8(r.u8()?)?;
        let pts_ns = r.u64()?;
        if width == 0 || height == 0 {
            return Err(MessageError::BadField("dimensions"));
        }
        Ok((VideoFrameHeader { width, height, pixel_format, pts_ns }, Self::WIRE_LEN))
    }
}

/// Typed fields of an AUDIO_BATCH; PCM bytes follow at the returned offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioBatchHeader {
    pub sample_rate: u32,
    pub channels: u8,
    pub sample_fmt: SampleFormat,
    pub frame_count: u32,
}

impl AudioBatchHeader {
    pub const WIRE_LEN: usize = 10;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u32(self.sample_rate);
        out.put_u8(self.channels);
        out.put_u8(self.sample_fmt as u8);
        out.put_u32(self.frame_count);
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), MessageError> {
        let mut r = Reader::new(buf);
        let sample_rate = r.u32()?;
        let channels = r.u8()?;
        let sample_fmt = SampleFormat::from_u8(r.u8()?)?;
        let frame_count = r.u32()?;
        if channels == 0 {
            return Err(MessageError::BadField("channels"));
        }
        Ok((AudioBatchHeader { sample_rate, channels, sample_fmt, frame_count }, Self::WIRE_LEN))
    }
}

/// PING/PONG body; the responder echoes the nonce unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub nonce: u64,
}

impl Heartbeat {
    pub fn encode(&self) -> Vec<u8> {
        self.nonce.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        Ok(Heartbeat { nonce: r.u64()? })
    }
}

/// Announces a peer joining; fanned out by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientJoin {
    pub slot_id: u32,
    pub display_name: String,
}

impl ClientJoin {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        if self.display_name.len() > MAX_DISPLAY_NAME {
            return Err(MessageError::NameTooLong { max: MAX_DISPLAY_NAME });
        }
        let mut out = Vec::with_capacity(5 + self.display_name.len());
        out.put_u32(self.slot_id);
        out.put_u8(self.display_name.len() as u8);
        out.extend_from_slice(self.display_name.as_bytes());
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        let slot_id = r.u32()?;
        let name_len = r.u8()? as usize;
        if name_len > MAX_DISPLAY_NAME {
            return Err(MessageError::NameTooLong { max: MAX_DISPLAY_NAME });
        }
        let name = r.bytes(name_len)?;
        let display_name = std::str::from_utf8(name)
            .map_err(|_| MessageError::BadUtf8)?
            .to_owned();
        Ok(ClientJoin { slot_id, display_name })
    }
}

/// Announces a peer leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLeave {
    pub slot_id: u32,
}

impl ClientLeave {
    pub fn encode(&self) -> Vec<u8> {
        self.slot_id.to_be_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        Ok(ClientLeave { slot_id: r.u32()? })
    }
}

/// Server-composed grid geometry so clients can size their terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub rows: u8,
    pub cols: u8,
    pub cell_width: u16,
    pub cell_height: u16,
}

impl GridLayout {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.put_u8(self.rows);
        out.put_u8(self.cols);
        out.put_u16(self.cell_width);
        out.put_u16(self.cell_height);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        let rows = r.u8()?;
        let cols = r.u8()?;
        let cell_width = r.u16()?;
        let cell_height = r.u16()?;
        if rows == 0 || cols == 0 {
            return Err(MessageError::BadField("grid dimensions"));
        }
        Ok(GridLayout { rows, cols, cell_width, cell_height })
    }
}

/// Error report: stable identifier plus a human-readable line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub code: String,
    pub detail: String,
}

impl ErrorMsg {
    pub fn encode(&self) -> Vec<u8> {
        let code = truncate_utf8(&self.code, 255);
        let detail = truncate_utf8(&self.detail, 255);
        let mut out = Vec::with_capacity(2 + code.len() + detail.len());
        out.put_u8(code.len() as u8);
        out.extend_from_slice(code);
        out.put_u8(detail.len() as u8);
        out.extend_from_slice(detail);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(buf);
        let code_len = r.u8()? as usize;
        let code = std::str::from_utf8(r.bytes(code_len)?)
            .map_err(|_| MessageError::BadUtf8)?
            .to_owned();
        let detail_len = r.u8()? as usize;
        let detail = std::str::from_utf8(r.bytes(detail_len)?)
            .map_err(|_| MessageError::BadUtf8)?
            .to_owned();
        Ok(ErrorMsg { code, detail })
    }
}

// Truncate to at most `max` bytes without splitting a code point.
fn truncate_utf8(s: &str, max: usize) -> &[u8] {
    let mut end = s.len().min(max);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

/// Bounds-checked big-endian cursor over a message body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        let end = self.pos.checked_add(n).ok_or(MessageError::Truncated { needed: n })?;
        if end > self.buf.len() {
            return Err(MessageError::Truncated { needed: end - self.buf.len() });
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    pub fn u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, MessageError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, MessageError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, MessageError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        self.take(n)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], MessageError> {
        let s = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(s);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            color_mode: ColorMode::Fg24,
            max_width: 320,
            max_height: 240,
            audio: true,
        }
    }

    #[test]
    fn hello_round_trip() {
        let hello = Hello {
            identity_pk: [1u8; 32],
            ephemeral_pk: [2u8; 32],
            nonce: [3u8; 32],
            caps: caps(),
            display_name: "alice".into(),
        };
        let bytes = hello.encode().unwrap();
        assert_eq!(Hello::decode(&bytes).unwrap(), hello);
    }

    #[test]
    fn hello_rejects_long_name() {
        let hello = Hello {
            identity_pk: [0u8; 32],
            ephemeral_pk: [0u8; 32],
            nonce: [0u8; 32],
            caps: caps(),
            display_name: "x".repeat(33),
        };
        assert!(matches!(hello.encode(), Err(MessageError::NameTooLong { .. })));
    }

    #[test]
    fn server_hello_round_trip() {
        let sh = ServerHello {
            identity_pk: [4u8; 32],
            ephemeral_pk: [5u8; 32],
            nonce: [6u8; 32],
            password_required: true,
            sig: [7u8; 64],
        };
        assert_eq!(ServerHello::decode(&sh.encode()).unwrap(), sh);
    }

    #[test]
    fn video_header_round_trip_and_offset() {
        let vh = VideoFrameHeader {
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Rgb24,
            pts_ns: 123_456_789,
        };
        let mut buf = Vec::new();
        vh.encode_into(&mut buf);
        buf.extend_from_slice(b"pixels");
        let (decoded, off) = VideoFrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded, vh);
        assert_eq!(&buf[off..], b"pixels");
    }

    #[test]
    fn video_header_rejects_zero_dims() {
        let vh = VideoFrameHeader {
            width: 0,
            height: 480,
            pixel_format: PixelFormat::Rgb24,
            pts_ns: 0,
        };
        let mut buf = Vec::new();
        vh.encode_into(&mut buf);
        assert!(VideoFrameHeader::decode(&buf).is_err());
    }

    #[test]
    fn audio_header_round_trip() {
        let ah = AudioBatchHeader {
            sample_rate: 48_000,
            channels: 1,
            sample_fmt: SampleFormat::F32le,
            frame_count: 960,
        };
        let mut buf = Vec::new();
        ah.encode_into(&mut buf);
        let (decoded, off) = AudioBatchHeader::decode(&buf).unwrap();
        assert_eq!(decoded, ah);
        assert_eq!(off, AudioBatchHeader::WIRE_LEN);
    }

    #[test]
    fn truncated_bodies_error_not_panic() {
        let hello = Hello {
            identity_pk: [1u8; 32],
            ephemeral_pk: [2u8; 32],
            nonce: [3u8; 32],
            caps: caps(),
            display_name: "bob".into(),
        };
        let bytes = hello.encode().unwrap();
        for cut in 0..bytes.len() {
            assert!(Hello::decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn error_msg_round_trip() {
        let e = ErrorMsg {
            code: "E_CRYPTO_REPLAY".into(),
            detail: "seq 9 <= 12".into(),
        };
        assert_eq!(ErrorMsg::decode(&e.encode()).unwrap(), e);
    }

    #[test]
    fn grid_layout_round_trip() {
        let g = GridLayout { rows: 2, cols: 3, cell_width: 80, cell_height: 24 };
        assert_eq!(GridLayout::decode(&g.encode()).unwrap(), g);
        let z = GridLayout { rows: 0, cols: 3, cell_width: 1, cell_height: 1 };
        assert!(GridLayout::decode(&z.encode()).is_err());
    }
}
