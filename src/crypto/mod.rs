//! Transparent per-field authenticated encryption of secrets at rest.
//!
//! A [`Codec`] wraps a key derived once at startup from a persisted master
//! secret. It is constructed explicitly and threaded through the store via
//! dependency injection rather than reached for as a process-global.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;

use crate::error::{Error, Result};

const PREFIX: &str = "enc:v1:";
const SALT: &[u8] = b"bitwarden-backup-salt-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const MASTER_KEY_ENV: &str = "BITWARDEN_BACKUP_MASTER_KEY";

#[derive(Clone)]
pub struct Codec {
    key: [u8; 32],
}

impl Codec {
    /// Resolves the master secret (env var, `data/.env`, `.env`, or a freshly
    /// generated and persisted one) and derives the encryption key.
    pub fn init() -> Result<Self> {
        let master = resolve_master_secret()?;
        let key = derive_key(&master);
        Ok(Self { key })
    }

    /// Builds a codec directly from a raw 32-byte master secret. Used by
    /// tests that want a deterministic key without touching the filesystem
    /// or environment.
    pub fn from_master_secret(master: &[u8]) -> Self {
        Self {
            key: derive_key(master),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| Error::EncryptionKeyNotSet)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::EncryptionKeyNotSet)?;
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        let encoded = base64::engine::general_purpose::STANDARD.encode(combined);
        Ok(format!("{PREFIX}{encoded}"))
    }

    pub fn decrypt(&self, value: &str) -> Result<String> {
        if value.is_empty() {
            return Ok(String::new());
        }
        let stripped = value.strip_prefix(PREFIX).unwrap_or(value);
        let raw = base64::engine::general_purpose::STANDARD
            .decode(stripped)
            .map_err(|_| Error::InvalidCiphertext)?;
        if raw.len() < NONCE_LEN {
            return Err(Error::InvalidCiphertext);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| Error::EncryptionKeyNotSet)?;
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::InvalidCiphertext)?;
        String::from_utf8(plaintext).map_err(|_| Error::InvalidCiphertext)
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(PREFIX)
    }
}

fn derive_key(master: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(master, SALT, PBKDF2_ITERATIONS, &mut key);
    key
}

fn resolve_master_secret() -> Result<Vec<u8>> {
    if let Ok(v) = std::env::var(MASTER_KEY_ENV) {
        if !v.is_empty() {
            return base64::engine::general_purpose::STANDARD
                .decode(v)
                .map_err(|e| Error::config(format!("invalid {MASTER_KEY_ENV}: {e}")));
        }
    }

    for path in [Path::new("data/.env"), Path::new(".env")] {
        if let Some(v) = read_env_file_key(path, MASTER_KEY_ENV)? {
            return base64::engine::general_purpose::STANDARD
                .decode(v)
                .map_err(|e| Error::config(format!("invalid master key in {path:?}: {e}")));
        }
    }

    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let encoded = base64::engine::general_purpose::STANDARD.encode(secret);
    persist_env_key(Path::new("data/.env"), MASTER_KEY_ENV, &encoded)?;
    Ok(secret.to_vec())
}

fn read_env_file_key(path: &Path, key: &str) -> Result<Option<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::config(format!("reading {path:?}: {e}"))),
    };
    Ok(parse_env_value(&contents, key))
}

fn parse_env_value(contents: &str, key: &str) -> Option<String> {
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start();
            let rest = rest.strip_prefix('=')?;
            let rest = rest.trim();
            let value = rest.strip_prefix('"').and_then(|r| r.strip_suffix('"'));
            return Some(value.unwrap_or(rest).to_string());
        }
    }
    None
}

/// Read-modify-write: preserves any other keys already present in the file.
fn persist_env_key(path: &Path, key: &str, value: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| Error::config(format!("creating {dir:?}: {e}")))?;
        }
    }

    let existing = fs::read_to_string(path).unwrap_or_default();
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !line.trim_start().starts_with(key))
        .map(|l| l.to_string())
        .collect();
    lines.push(format!("{key}=\"{value}\""));
    let rendered = lines.join("\n") + "\n";

    let tmp_path = tmp_sibling(path);
    {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| Error::config(format!("creating {tmp_path:?}: {e}")))?;
        f.write_all(rendered.as_bytes())
            .map_err(|e| Error::config(format!("writing {tmp_path:?}: {e}")))?;
        set_owner_only(&f)?;
    }
    fs::rename(&tmp_path, path).map_err(|e| Error::config(format!("renaming into {path:?}: {e}")))?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "env".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn set_owner_only(f: &fs::File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    f.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::config(format!("chmod: {e}")))
}

#[cfg(not(unix))]
fn set_owner_only(_f: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::from_master_secret(b"test-master-secret-32-bytes-long")
    }

    #[test]
    fn round_trips_non_empty_strings() {
        let c = codec();
        for s in ["a", "hello world", "s3-secret-key-0123456789"] {
            let enc = c.encrypt(s).unwrap();
            assert!(enc.starts_with(PREFIX));
            assert_eq!(c.decrypt(&enc).unwrap(), s);
        }
    }

    #[test]
    fn empty_round_trips_to_empty() {
        let c = codec();
        assert_eq!(c.encrypt("").unwrap(), "");
        assert_eq!(c.decrypt("").unwrap(), "");
    }

    #[test]
    fn is_encrypted_checks_prefix_only() {
        assert!(Codec::is_encrypted("enc:v1:abc"));
        assert!(!Codec::is_encrypted("abc"));
        assert!(!Codec::is_encrypted(""));
    }

    #[test]
    fn decrypt_rejects_short_garbage() {
        let c = codec();
        assert!(c.decrypt("enc:v1:YQ==").is_err());
    }

    #[test]
    fn decrypt_tolerates_missing_prefix_on_legacy_values() {
        let c = codec();
        let enc = c.encrypt("legacy").unwrap();
        let bare = enc.strip_prefix(PREFIX).unwrap();
        assert_eq!(c.decrypt(bare).unwrap(), "legacy");
    }

    #[test]
    fn nonce_is_randomized_per_call() {
        let c = codec();
        let a = c.encrypt("same plaintext").unwrap();
        let b = c.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn persist_and_read_env_key_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        persist_env_key(&path, "FOO", "bar").unwrap();
        persist_env_key(&path, "BITWARDEN_BACKUP_MASTER_KEY", "baz").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("FOO=\"bar\""));
        assert_eq!(
            read_env_file_key(&path, "BITWARDEN_BACKUP_MASTER_KEY")
                .unwrap()
                .unwrap(),
            "baz"
        );
    }

    proptest::proptest! {
        /// §8 property 1: every non-empty string round-trips and the
        /// ciphertext always carries the self-describing prefix.
        #[test]
        fn codec_round_trips_arbitrary_strings(s in "\\PC{1,200}") {
            let c = codec();
            let enc = c.encrypt(&s).unwrap();
            proptest::prop_assert!(enc.starts_with(PREFIX));
            proptest::prop_assert_eq!(c.decrypt(&enc).unwrap(), s);
        }

        /// §8 property 2: re-encrypting an already-prefixed value must never
        /// wrap it in a second layer of ciphertext.
        #[test]
        fn encode_if_needed_style_checks_stay_single_layer(s in "\\PC{1,200}") {
            let c = codec();
            let once = c.encrypt(&s).unwrap();
            let reencoded = if Codec::is_encrypted(&once) {
                once.clone()
            } else {
                c.encrypt(&once).unwrap()
            };
            proptest::prop_assert_eq!(&reencoded, &once);
            proptest::prop_assert_eq!(c.decrypt(&reencoded).unwrap(), s);
        }
    }
}
