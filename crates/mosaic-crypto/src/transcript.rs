//! Handshake transcript accumulation.
//!
//! Both peers append the same handshake fields in the same order as
//! `(tag, len, bytes)` tuples; the SHA-256 of the accumulated bytes binds
//! signatures and session keys to the exact exchange that happened.

use sha2::{Digest, Sha256};

/// Tags for handshake transcript fields. The numeric values are part of
/// the protocol: both sides must agree or key derivation diverges.
pub mod tags {
    pub const DOMAIN: u32 = 0;
    pub const CLIENT_IDENTITY: u32 = 1;
    pub const CLIENT_EPHEMERAL: u32 = 2;
    pub const CLIENT_NONCE: u32 = 3;
    pub const CLIENT_CAPS: u32 = 4;
    pub const SERVER_IDENTITY: u32 = 5;
    pub const SERVER_EPHEMERAL: u32 = 6;
    pub const SERVER_NONCE: u32 = 7;
    pub const AUTH_SALT: u32 = 8;
    pub const AUTH_ROUNDS: u32 = 9;
}

/// Deterministic transcript builder.
#[derive(Clone, Debug)]
pub struct Transcript {
    buf: Vec<u8>,
}

impl Transcript {
    /// Start a transcript under a domain-separation label.
    pub fn new(domain: &'static str) -> Self {
        let mut t = Transcript { buf: Vec::with_capacity(256) };
        t.append_bytes(tags::DOMAIN, domain.as_bytes());
        t
    }

    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&tag.to_be_bytes());
        self.buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(data);
        self
    }

    pub fn append_u64(&mut self, tag: u32, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&tag.to_be_bytes());
        self.buf.extend_from_slice(&8u32.to_be_bytes());
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// SHA-256 of the transcript so far. Non-consuming: the handshake
    /// hashes the transcript once at signature time and again after the
    /// auth step extends it.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.buf);
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        out
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_appends_same_hash() {
        let mut a = Transcript::new("mosaic hs v1");
        let mut b = Transcript::new("mosaic hs v1");
        a.append_bytes(tags::CLIENT_NONCE, b"nonce").append_u64(tags::AUTH_ROUNDS, 16);
        b.append_bytes(tags::CLIENT_NONCE, b"nonce").append_u64(tags::AUTH_ROUNDS, 16);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn order_and_tags_matter() {
        let mut a = Transcript::new("d");
        let mut b = Transcript::new("d");
        a.append_bytes(1, b"x").append_bytes(2, b"y");
        b.append_bytes(2, b"y").append_bytes(1, b"x");
        assert_ne!(a.hash(), b.hash());

        let mut c = Transcript::new("d");
        let mut d = Transcript::new("d");
        c.append_bytes(1, b"x");
        d.append_bytes(2, b"x");
        assert_ne!(c.hash(), d.hash());
    }

    #[test]
    fn domain_separates() {
        let a = Transcript::new("mosaic hs v1");
        let b = Transcript::new("mosaic hs v2");
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn length_framing_prevents_concatenation_ambiguity() {
        let mut a = Transcript::new("d");
        let mut b = Transcript::new("d");
        a.append_bytes(1, b"ab").append_bytes(1, b"c");
        b.append_bytes(1, b"a").append_bytes(1, b"bc");
        assert_ne!(a.hash(), b.hash());
    }
}
