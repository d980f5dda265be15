//! Directional session sealing.
//!
//! After the handshake both peers hold two 32-byte keys derived from the
//! ECDH shared secret and the transcript hash: one for client→server
//! traffic, one for server→client. Each packet is sealed with
//! XChaCha20-Poly1305 under the direction-appropriate key; the 24-byte
//! nonce is the packet sequence number zero-extended to 12 bytes followed
//! by a 12-byte direction context, so nonces never repeat under a key and
//! a reflected packet fails to open in the other direction.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// AEAD tag length (appended to every sealed payload).
pub const TAG_LEN: usize = 16;

/// 12-byte direction context strings baked into the nonce.
pub const CONTEXT_C2S: &[u8; 12] = b"mosaic-c2s-1";
pub const CONTEXT_S2C: &[u8; 12] = b"mosaic-s2c-1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionCryptoError {
    #[error("encryption failed")]
    EncryptFailed,

    /// Authentication failure: wrong key, tampered ciphertext, or
    /// mismatched AAD. Fatal to the connection.
    #[error("decryption failed")]
    DecryptFailed,

    /// Sequence regression: `seq` did not advance past the last accepted
    /// value. Dropped per-packet; the connection stays up.
    #[error("replayed sequence {seq} (last accepted {last})")]
    Replay { seq: u64, last: u64 },

    /// Decrypted length disagrees with what the header promised.
    #[error("plaintext length {got} disagrees with header ({expected})")]
    LengthMismatch { expected: usize, got: usize },
}

impl SessionCryptoError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            SessionCryptoError::EncryptFailed => "E_CRYPTO_SEAL",
            SessionCryptoError::DecryptFailed => "E_CRYPTO_AUTH",
            SessionCryptoError::Replay { .. } => "E_CRYPTO_REPLAY",
            SessionCryptoError::LengthMismatch { .. } => "E_CRYPTO_LENGTH",
        }
    }

    /// Whether this failure closes the connection or only drops the packet.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionCryptoError::Replay { .. } | SessionCryptoError::LengthMismatch { .. })
    }
}

/// Traffic direction, used to pick keys and nonce contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn context(self) -> &'static [u8; 12] {
        match self {
            Direction::ClientToServer => CONTEXT_C2S,
            Direction::ServerToClient => CONTEXT_S2C,
        }
    }
}

/// Both directional keys for one session.
pub struct SessionKeys {
    pub c2s: [u8; 32],
    pub s2c: [u8; 32],
}

/// Derive the directional session keys.
///
/// `HKDF-SHA256(salt = transcript_hash, ikm = shared)` expanded under two
/// fixed labels. Binding the transcript hash as salt means any divergence
/// in what the two peers believe was said yields unrelated keys.
pub fn derive_session(shared: &[u8; 32], transcript_hash: &[u8; 32]) -> SessionKeys {
    let hk = Hkdf::<Sha256>::new(Some(transcript_hash), shared);
    let mut c2s = [0u8; 32];
    let mut s2c = [0u8; 32];
    hk.expand(b"mosaic c2s key v1", &mut c2s).expect("hkdf expand");
    hk.expand(b"mosaic s2c key v1", &mut s2c).expect("hkdf expand");
    SessionKeys { c2s, s2c }
}

fn nonce_for(seq: u64, context: &[u8; 12]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[4..12].copy_from_slice(&seq.to_be_bytes());
    nonce[12..24].copy_from_slice(context);
    nonce
}

/// Sealing half: owned by the writer thread of a connection.
///
/// The caller supplies `seq` (it also lives in the packet header); this
/// type only turns it into a nonce, it does not allocate sequence numbers.
pub struct SealKey {
    aead: XChaCha20Poly1305,
    context: &'static [u8; 12],
}

impl SealKey {
    pub fn new(key: &[u8; 32], direction: Direction) -> Self {
        SealKey {
            aead: XChaCha20Poly1305::new(Key::from_slice(key)),
            context: direction.context(),
        }
    }

    /// Encrypt `plaintext`; returns ciphertext with the 16-byte tag
    /// appended.
    pub fn seal(&self, seq: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionCryptoError> {
        let nonce = nonce_for(seq, self.context);
        self.aead
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| SessionCryptoError::EncryptFailed)
    }
}

/// Opening half: owned by the reader thread of a connection.
///
/// Enforces strictly-increasing sequence numbers: a packet whose `seq`
/// does not advance past the last accepted one is rejected as a replay
/// before any AEAD work happens.
pub struct OpenKey {
    aead: XChaCha20Poly1305,
    context: &'static [u8; 12],
    last_seq: Option<u64>,
}

impl OpenKey {
    pub fn new(key: &[u8; 32], direction: Direction) -> Self {
        OpenKey {
            aead: XChaCha20Poly1305::new(Key::from_slice(key)),
            context: direction.context(),
            last_seq: None,
        }
    }

    /// Decrypt and authenticate; advances the replay floor only on
    /// success.
    pub fn open(
        &mut self,
        seq: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, SessionCryptoError> {
        if let Some(last) = self.last_seq {
            if seq <= last {
                return Err(SessionCryptoError::Replay { seq, last });
            }
        }
        let nonce = nonce_for(seq, self.context);
        let pt = self
            .aead
            .decrypt(XNonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| SessionCryptoError::DecryptFailed)?;
        self.last_seq = Some(seq);
        Ok(Zeroizing::new(pt))
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SealKey, OpenKey) {
        let keys = derive_session(&[0x11; 32], &[0x22; 32]);
        (
            SealKey::new(&keys.c2s, Direction::ClientToServer),
            OpenKey::new(&keys.c2s, Direction::ClientToServer),
        )
    }

    #[test]
    fn seal_open_round_trip() {
        let (seal, mut open) = pair();
        let aad = b"header bytes";
        let ct = seal.seal(1, aad, b"payload").unwrap();
        assert_eq!(ct.len(), 7 + TAG_LEN);
        let pt = open.open(1, aad, &ct).unwrap();
        assert_eq!(&pt[..], b"payload");
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (seal, mut open) = pair();
        let mut ct = seal.seal(1, b"aad", b"payload").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(
            open.open(1, b"aad", &ct),
            Err(SessionCryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn tampered_aad_rejected() {
        let (seal, mut open) = pair();
        let ct = seal.seal(1, b"aad", b"payload").unwrap();
        assert!(matches!(
            open.open(1, b"abd", &ct),
            Err(SessionCryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn wrong_seq_means_wrong_nonce() {
        let (seal, mut open) = pair();
        let ct = seal.seal(1, b"aad", b"payload").unwrap();
        assert!(matches!(
            open.open(2, b"aad", &ct),
            Err(SessionCryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn replayed_seq_rejected_before_decrypt() {
        let (seal, mut open) = pair();
        let ct1 = seal.seal(1, b"aad", b"one").unwrap();
        let ct2 = seal.seal(2, b"aad", b"two").unwrap();
        assert!(open.open(1, b"aad", &ct1).is_ok());
        assert!(open.open(2, b"aad", &ct2).is_ok());
        // Re-inject the first valid ciphertext after the second arrived.
        match open.open(1, b"aad", &ct1) {
            Err(err) => {
                assert_eq!(err, SessionCryptoError::Replay { seq: 1, last: 2 });
                assert_eq!(err.stable_code(), "E_CRYPTO_REPLAY");
                assert!(!err.is_fatal());
            }
            Ok(_) => panic!("replay must be rejected"),
        }
        // The floor did not move; the next genuine packet still opens.
        let ct3 = seal.seal(3, b"aad", b"three").unwrap();
        assert!(open.open(3, b"aad", &ct3).is_ok());
    }

    #[test]
    fn directions_are_isolated() {
        let keys = derive_session(&[0x11; 32], &[0x22; 32]);
        let seal_c2s = SealKey::new(&keys.c2s, Direction::ClientToServer);
        let mut open_s2c = OpenKey::new(&keys.s2c, Direction::ServerToClient);
        let ct = seal_c2s.seal(1, b"", b"msg").unwrap();
        assert!(open_s2c.open(1, b"", &ct).is_err());

        // Same key, wrong direction context: still rejected.
        let mut open_wrong_ctx = OpenKey::new(&keys.c2s, Direction::ServerToClient);
        assert!(open_wrong_ctx.open(1, b"", &ct).is_err());
    }

    #[test]
    fn derive_is_deterministic_and_directional() {
        let a = derive_session(&[0x11; 32], &[0x22; 32]);
        let b = derive_session(&[0x11; 32], &[0x22; 32]);
        assert_eq!(a.c2s, b.c2s);
        assert_eq!(a.s2c, b.s2c);
        assert_ne!(a.c2s, a.s2c);

        let c = derive_session(&[0x11; 32], &[0x23; 32]);
        assert_ne!(a.c2s, c.c2s);
    }

    #[test]
    fn nonce_layout() {
        let n = nonce_for(0x0102_0304_0506_0708, CONTEXT_C2S);
        assert_eq!(&n[0..4], &[0, 0, 0, 0]);
        assert_eq!(&n[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&n[12..24], CONTEXT_C2S);
    }
}
