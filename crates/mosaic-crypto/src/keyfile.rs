//! Identity key files.
//!
//! Binary layout, all fields fixed-size:
//!
//! ```text
//! magic    b"MOSAICID1\n"          10 bytes
//! kdf      u8                       0 = plaintext, 1 = bcrypt-pbkdf
//! -- kdf = 0 --
//! seed     [u8; 32]
//! -- kdf = 1 --
//! salt     [u8; 16]
//! rounds   u32 BE
//! nonce    [u8; 24]
//! sealed   seed ciphertext + tag   48 bytes
//! ```
//!
//! Encrypted files seal the Ed25519 seed with XChaCha20-Poly1305 under a
//! bcrypt-pbkdf-stretched password key; the magic doubles as AAD so a
//! re-labelled file fails to open.

use std::fs;
use std::io;
use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::identity::Identity;
use crate::password;

const MAGIC: &[u8; 10] = b"MOSAICID1\n";
const KDF_NONE: u8 = 0;
const KDF_BCRYPT: u8 = 1;

#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("key file io: {0}")]
    Io(#[from] io::Error),

    #[error("not a mosaic identity file")]
    BadMagic,

    #[error("identity file is malformed")]
    Malformed,

    #[error("identity file is password-protected")]
    PasswordRequired,

    #[error("wrong password or corrupted identity file")]
    BadPassword,

    #[error("key derivation failed")]
    KdfFailed,
}

impl KeyFileError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            KeyFileError::Io(_) => "E_CONFIG_KEYFILE_IO",
            KeyFileError::BadMagic => "E_CONFIG_KEYFILE_MAGIC",
            KeyFileError::Malformed => "E_CONFIG_KEYFILE_MALFORMED",
            KeyFileError::PasswordRequired => "E_CONFIG_KEYFILE_PASSWORD_REQUIRED",
            KeyFileError::BadPassword => "E_CRYPTO_KEYFILE_PASSWORD",
            KeyFileError::KdfFailed => "E_CRYPTO_KDF",
        }
    }
}

/// Write `identity` to `path`, encrypting when a password is given.
pub fn save_identity(
    path: &Path,
    identity: &Identity,
    password: Option<&str>,
) -> Result<(), KeyFileError> {
    let seed = Zeroizing::new(identity.seed());
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(MAGIC);
    match password {
        None => {
            out.push(KDF_NONE);
            out.extend_from_slice(seed.as_ref());
        }
        Some(pw) => {
            let mut salt = [0u8; 16];
            let mut nonce = [0u8; 24];
            getrandom::getrandom(&mut salt).map_err(|_| KeyFileError::KdfFailed)?;
            getrandom::getrandom(&mut nonce).map_err(|_| KeyFileError::KdfFailed)?;
            let rounds = password::DEFAULT_ROUNDS;
            let key = password::derive_key(pw, &salt, rounds)
                .map_err(|_| KeyFileError::KdfFailed)?;
            let aead = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
            let sealed = aead
                .encrypt(
                    XNonce::from_slice(&nonce),
                    Payload { msg: seed.as_ref(), aad: MAGIC },
                )
                .map_err(|_| KeyFileError::KdfFailed)?;
            out.push(KDF_BCRYPT);
            out.extend_from_slice(&salt);
            out.extend_from_slice(&rounds.to_be_bytes());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&sealed);
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, &out)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Load an identity from `path`, decrypting with `password` if the file
/// requires one.
pub fn load_identity(path: &Path, password: Option<&str>) -> Result<Identity, KeyFileError> {
    let data = fs::read(path)?;
    if data.len() < MAGIC.len() + 1 || &data[..MAGIC.len()] != MAGIC {
        return Err(KeyFileError::BadMagic);
    }
    let kdf = data[MAGIC.len()];
    let body = &data[MAGIC.len() + 1..];
    match kdf {
        KDF_NONE => {
            let seed: [u8; 32] = body.try_into().map_err(|_| KeyFileError::Malformed)?;
            Ok(Identity::from_seed(&Zeroizing::new(seed)))
        }
        KDF_BCRYPT => {
            // salt(16) + rounds(4) + nonce(24) + seed+tag(48)
            if body.len() != 16 + 4 + 24 + 48 {
                return Err(KeyFileError::Malformed);
            }
            let pw = password.ok_or(KeyFileError::PasswordRequired)?;
            let salt: [u8; 16] = body[0..16].try_into().expect("sized");
            let rounds = u32::from_be_bytes(body[16..20].try_into().expect("sized"));
            let nonce: [u8; 24] = body[20..44].try_into().expect("sized");
            let sealed = &body[44..];
            let key = password::derive_key(pw, &salt, rounds)
                .map_err(|_| KeyFileError::KdfFailed)?;
            let aead = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
            let seed = aead
                .decrypt(XNonce::from_slice(&nonce), Payload { msg: sealed, aad: MAGIC })
                .map_err(|_| KeyFileError::BadPassword)?;
            let seed: [u8; 32] = seed.as_slice().try_into().map_err(|_| KeyFileError::Malformed)?;
            Ok(Identity::from_seed(&Zeroizing::new(seed)))
        }
        _ => Err(KeyFileError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plaintext_round_trip() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("id.key");
        let id = Identity::generate();
        save_identity(&p, &id, None).unwrap();
        let loaded = load_identity(&p, None).unwrap();
        assert_eq!(loaded.public_key(), id.public_key());
    }

    #[test]
    fn encrypted_round_trip() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("id.key");
        let id = Identity::generate();
        save_identity(&p, &id, Some("correct horse")).unwrap();

        let loaded = load_identity(&p, Some("correct horse")).unwrap();
        assert_eq!(loaded.public_key(), id.public_key());

        assert!(matches!(
            load_identity(&p, Some("wrong")),
            Err(KeyFileError::BadPassword)
        ));
        assert!(matches!(
            load_identity(&p, None),
            Err(KeyFileError::PasswordRequired)
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("id.key");
        fs::write(&p, b"OPENSSH PRIVATE KEY or whatever").unwrap();
        assert!(matches!(load_identity(&p, None), Err(KeyFileError::BadMagic)));
    }

    #[test]
    fn truncated_file_rejected() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("id.key");
        let id = Identity::generate();
        save_identity(&p, &id, Some("pw")).unwrap();
        let data = fs::read(&p).unwrap();
        fs::write(&p, &data[..data.len() - 5]).unwrap();
        assert!(matches!(load_identity(&p, Some("pw")), Err(KeyFileError::Malformed)));
    }
}
