//! Known-hosts pin store.
//!
//! One entry per line:
//! `<host_id> <base64(pk)> <first_seen_unix> <last_seen_unix> <pinned:0|1>`
//! Lines starting with `#` are comments. Malformed lines are logged and
//! skipped on read so one bad edit never locks a user out of the file.
//! The file is rewritten atomically (temp + rename); a reader racing a
//! writer sees either the old or the new file, never a torn one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum KnownHostsError {
    #[error("known-hosts io: {0}")]
    Io(#[from] io::Error),

    /// The pinned key for this host differs from the presented one.
    #[error("host key mismatch for {host_id}: pinned key differs from presented key")]
    Mismatch { host_id: String },

    /// Host unknown and the policy forbids trust-on-first-use.
    #[error("host {host_id} is not in the known-hosts file")]
    Unknown { host_id: String },
}

impl KnownHostsError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            KnownHostsError::Io(_) => "E_CRYPTO_HOSTFILE_IO",
            KnownHostsError::Mismatch { .. } => "E_CRYPTO_HOST_MISMATCH",
            KnownHostsError::Unknown { .. } => "E_CRYPTO_HOST_UNKNOWN",
        }
    }
}

/// One pinned host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    pub host_id: String,
    pub public_key: [u8; 32],
    pub first_seen_unix: u64,
    pub last_seen_unix: u64,
    pub pinned: bool,
}

/// Lookup outcome for a presented host key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Known,
    Unknown,
    Mismatch,
}

/// What to do when a host is seen for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TofuPolicy {
    /// Pin the key on first contact.
    AutoAdd,
    /// Refuse unknown hosts (pre-seeded deployments).
    Reject,
}

/// In-memory view of a known-hosts file.
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<KnownHost>,
}

impl KnownHosts {
    /// Load from `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, KnownHostsError> {
        let path = path.into();
        let mut entries = Vec::new();
        match fs::read_to_string(&path) {
            Ok(text) => {
                for (lineno, line) in text.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    match parse_line(line) {
                        Some(entry) => entries.push(entry),
                        None => {
                            warn!(file = %path.display(), line = lineno + 1, "skipping malformed known-hosts line");
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(KnownHosts { path, entries })
    }

    pub fn lookup(&self, host_id: &str, public_key: &[u8; 32]) -> Lookup {
        match self.entries.iter().find(|e| e.host_id == host_id) {
            Some(e) if &e.public_key == public_key => Lookup::Known,
            Some(_) => Lookup::Mismatch,
            None => Lookup::Unknown,
        }
    }

    /// Verify a presented key against the store, applying `policy` on
    /// first contact. Updates `last_seen` (and adds the entry under
    /// `AutoAdd`) and persists on success.
    pub fn verify_or_pin(
        &mut self,
        host_id: &str,
        public_key: &[u8; 32],
        policy: TofuPolicy,
    ) -> Result<Lookup, KnownHostsError> {
        let now = unix_now();
        match self.lookup(host_id, public_key) {
            Lookup::Known => {
                if let Some(e) = self.entries.iter_mut().find(|e| e.host_id == host_id) {
                    e.last_seen_unix = now;
                }
                self.save()?;
                Ok(Lookup::Known)
            }
            Lookup::Mismatch => Err(KnownHostsError::Mismatch { host_id: host_id.to_owned() }),
            Lookup::Unknown => match policy {
                TofuPolicy::Reject => Err(KnownHostsError::Unknown { host_id: host_id.to_owned() }),
                TofuPolicy::AutoAdd => {
                    self.entries.push(KnownHost {
                        host_id: host_id.to_owned(),
                        public_key: *public_key,
                        first_seen_unix: now,
                        last_seen_unix: now,
                        pinned: true,
                    });
                    self.save()?;
                    Ok(Lookup::Unknown)
                }
            },
        }
    }

    /// Rewrite the file atomically.
    pub fn save(&self) -> Result<(), KnownHostsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut text = String::from("# mosaic known hosts\n");
        for e in &self.entries {
            text.push_str(&format!(
                "{} {} {} {} {}\n",
                e.host_id,
                B64.encode(e.public_key),
                e.first_seen_unix,
                e.last_seen_unix,
                e.pinned as u8,
            ));
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn entries(&self) -> &[KnownHost] {
        &self.entries
    }
}

fn parse_line(line: &str) -> Option<KnownHost> {
    let mut parts = line.split_whitespace();
    let host_id = parts.next()?.to_owned();
    let pk_b64 = parts.next()?;
    let first_seen = parts.next()?.parse::<u64>().ok()?;
    let last_seen = parts.next()?.parse::<u64>().ok()?;
    let pinned = match parts.next()? {
        "0" => false,
        "1" => true,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    let pk_bytes = B64.decode(pk_b64).ok()?;
    let public_key: [u8; 32] = pk_bytes.try_into().ok()?;
    Some(KnownHost {
        host_id,
        public_key,
        first_seen_unix: first_seen,
        last_seen_unix: last_seen,
        pinned,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Convenience for tests and pre-seeding tools.
pub fn append_entry(path: &Path, entry: &KnownHost) -> Result<(), KnownHostsError> {
    let mut store = KnownHosts::load(path)?;
    store.entries.push(entry.clone());
    store.save()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("known_hosts")
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = KnownHosts::load(path(&dir)).unwrap();
        assert!(store.entries().is_empty());
    }

    #[test]
    fn tofu_add_then_known_then_mismatch() {
        let dir = tempdir().unwrap();
        let mut store = KnownHosts::load(path(&dir)).unwrap();
        let pk = [0xAA; 32];

        // First contact pins the key.
        assert_eq!(store.verify_or_pin("abcd1234", &pk, TofuPolicy::AutoAdd).unwrap(), Lookup::Unknown);

        // Reload from disk: the pin persisted.
        let mut store = KnownHosts::load(path(&dir)).unwrap();
        assert_eq!(store.lookup("abcd1234", &pk), Lookup::Known);
        assert_eq!(store.verify_or_pin("abcd1234", &pk, TofuPolicy::Reject).unwrap(), Lookup::Known);

        // A different key for the same host is fatal.
        let err = store.verify_or_pin("abcd1234", &[0xBB; 32], TofuPolicy::AutoAdd).unwrap_err();
        assert_eq!(err.stable_code(), "E_CRYPTO_HOST_MISMATCH");
    }

    #[test]
    fn reject_policy_refuses_unknown() {
        let dir = tempdir().unwrap();
        let mut store = KnownHosts::load(path(&dir)).unwrap();
        let err = store.verify_or_pin("ffff0000", &[1; 32], TofuPolicy::Reject).unwrap_err();
        assert_eq!(err.stable_code(), "E_CRYPTO_HOST_UNKNOWN");
    }

    #[test]
    fn malformed_lines_skipped_comments_ignored() {
        let dir = tempdir().unwrap();
        let p = path(&dir);
        let good = KnownHost {
            host_id: "cafe0001".into(),
            public_key: [3; 32],
            first_seen_unix: 100,
            last_seen_unix: 200,
            pinned: true,
        };
        let text = format!(
            "# comment\n\nnot a valid line\n{} {} {} {} {}\nshort b64!!! 1 2 1\n",
            good.host_id,
            B64.encode(good.public_key),
            good.first_seen_unix,
            good.last_seen_unix,
            1
        );
        fs::write(&p, text).unwrap();
        let store = KnownHosts::load(&p).unwrap();
        assert_eq!(store.entries(), &[good]);
    }

    #[test]
    fn save_is_atomic_rewrite() {
        let dir = tempdir().unwrap();
        let p = path(&dir);
        let mut store = KnownHosts::load(&p).unwrap();
        store.verify_or_pin("aaaa", &[1; 32], TofuPolicy::AutoAdd).unwrap();
        store.verify_or_pin("bbbb", &[2; 32], TofuPolicy::AutoAdd).unwrap();
        let text = fs::read_to_string(&p).unwrap();
        assert_eq!(text.lines().filter(|l| !l.starts_with('#')).count(), 2);
        assert!(!p.with_extension("tmp").exists());
    }
}
