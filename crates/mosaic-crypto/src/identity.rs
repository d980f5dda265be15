//! Identity and ephemeral keypairs.
//!
//! Every endpoint carries a long-lived Ed25519 signing pair as its
//! identity; key exchange uses a fresh X25519 ephemeral per connection,
//! so there is no static exchange key to pin beyond the signing key.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::host_id;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    InvalidSignature,
}

/// An endpoint identity: Ed25519 signing keypair.
///
/// The seed is zeroized on drop via `SigningKey`'s own impl.
pub struct Identity {
    sign_key: SigningKey,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Identity { sign_key: SigningKey::generate(&mut OsRng) }
    }

    /// Rebuild from a stored 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Identity { sign_key: SigningKey::from_bytes(seed) }
    }

    /// The 32-byte seed, for persistence. Callers must zeroize their copy.
    pub fn seed(&self) -> [u8; 32] {
        self.sign_key.to_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.sign_key.verifying_key().to_bytes()
    }

    /// Short printable identifier derived from the public key.
    pub fn host_id(&self) -> String {
        host_id(&self.public_key())
    }

    /// Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let sig: Signature = self.sign_key.sign(message);
        sig.to_bytes()
    }
}

/// Verify an Ed25519 signature.
pub fn verify_signature(
    pub_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), IdentityError> {
    let vk = VerifyingKey::from_bytes(pub_key).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    vk.verify_strict(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}

/// A per-connection X25519 ephemeral secret.
///
/// Built from explicit bytes rather than `EphemeralSecret` so the
/// handshake can be driven deterministically under test; zeroized on
/// drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKey {
    #[zeroize(skip)] // StaticSecret zeroizes itself
    secret: StaticSecret,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        EphemeralKey { secret: StaticSecret::random_from_rng(OsRng) }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EphemeralKey { secret: StaticSecret::from(bytes) }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.secret).as_bytes()
    }

    /// X25519 Diffie-Hellman with the peer's ephemeral public key.
    pub fn diffie_hellman(&self, peer_pub: &[u8; 32]) -> [u8; 32] {
        let peer = X25519PublicKey::from(*peer_pub);
        *self.secret.diffie_hellman(&peer).as_bytes()
    }
}
