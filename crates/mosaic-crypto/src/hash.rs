//! Hash helpers.

use sha2::{Digest, Sha256};

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Host identifier derived from a signing public key.
///
/// `host_id = hex(sha256(sign_pub))[..16]` — short enough to eyeball in a
/// known-hosts file, long enough (64 bits) that collisions take deliberate
/// effort, and the full key is pinned alongside it anyway.
pub fn host_id(sign_pub: &[u8; 32]) -> String {
    hex::encode(&sha256(sign_pub)[..8])
}
