//! Password proof for the optional auth step.
//!
//! The server never sees the password: the client stretches it with
//! bcrypt-pbkdf (salt and round count supplied by the server) and returns
//! an HMAC over the handshake transcript hash. The server holds the same
//! stretched key and compares in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Default bcrypt-pbkdf round count for new deployments.
pub const DEFAULT_ROUNDS: u32 = 16;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("bcrypt-pbkdf failed")]
    KdfFailed,
    #[error("password proof rejected")]
    ProofRejected,
}

impl PasswordError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            PasswordError::KdfFailed => "E_CRYPTO_KDF",
            PasswordError::ProofRejected => "E_CRYPTO_BAD_PASSWORD",
        }
    }
}

/// Stretch a password into a 32-byte key.
pub fn derive_key(
    password: &str,
    salt: &[u8; 16],
    rounds: u32,
) -> Result<Zeroizing<[u8; 32]>, PasswordError> {
    let mut out = Zeroizing::new([0u8; 32]);
    bcrypt_pbkdf::bcrypt_pbkdf(password.as_bytes(), salt, rounds, out.as_mut())
        .map_err(|_| PasswordError::KdfFailed)?;
    Ok(out)
}

/// MAC the transcript hash with the stretched key.
pub fn prove(key: &[u8; 32], transcript_hash: &[u8; 32]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts 32-byte keys");
    mac.update(transcript_hash);
    let out = mac.finalize().into_bytes();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    bytes
}

/// Constant-time verification of a presented proof.
pub fn verify(
    key: &[u8; 32],
    transcript_hash: &[u8; 32],
    presented: &[u8; 32],
) -> Result<(), PasswordError> {
    let expected = prove(key, transcript_hash);
    if constant_time_eq::constant_time_eq(&expected, presented) {
        Ok(())
    } else {
        Err(PasswordError::ProofRejected)
    }
}
