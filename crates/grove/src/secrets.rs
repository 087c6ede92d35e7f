//! Encrypted secrets blob.
//!
//! Secrets are a flat string map held in memory, never part of the
//! replicated tree. On disk they are one base64 blob: a random 96-bit
//! IV followed by the AES-256-GCM ciphertext of the JSON-encoded map.
//! The key is derived from the space id (SHA-256 of its UTF-8 bytes; a
//! GUID string is not a legal AES key length on its own).
//!
//! Decrypt failure is not fatal: callers fall back to an empty map and
//! the user re-enters keys.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::SpaceError;

pub type SecretMap = BTreeMap<String, String>;

const IV_LEN: usize = 12;

fn derive_key(space_id: &str) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(space_id.as_bytes());
    Key::<Aes256Gcm>::clone_from_slice(&digest)
}

/// Encrypt the map into the base64 `iv | ciphertext` envelope.
pub fn encrypt(space_id: &str, secrets: &SecretMap) -> Result<String, SpaceError> {
    let plaintext =
        serde_json::to_vec(secrets).map_err(|_| SpaceError::SecretEncryptFailed)?;
    let cipher = Aes256Gcm::new(&derive_key(space_id));

    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|_| SpaceError::SecretEncryptFailed)?;

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Decrypt the envelope back into a map.
pub fn decrypt(space_id: &str, blob: &str) -> Result<SecretMap, SpaceError> {
    let bytes = BASE64
        .decode(blob.trim())
        .map_err(|_| SpaceError::SecretDecryptFailed)?;
    if bytes.len() < IV_LEN {
        return Err(SpaceError::SecretDecryptFailed);
    }
    let (iv, ciphertext) = bytes.split_at(IV_LEN);
    let cipher = Aes256Gcm::new(&derive_key(space_id));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| SpaceError::SecretDecryptFailed)?;
    serde_json::from_slice(&plaintext).map_err(|_| SpaceError::SecretDecryptFailed)
}

/// Write the blob. No-op when the map equals what was last read/written
/// (the caller passes that via `previous`).
pub fn save(
    path: &Path,
    space_id: &str,
    secrets: &SecretMap,
    previous: Option<&SecretMap>,
) -> Result<bool, SpaceError> {
    if previous == Some(secrets) {
        return Ok(false);
    }
    let blob = encrypt(space_id, secrets)?;
    fs::write(path, blob).map_err(|source| SpaceError::io(path, source))?;
    Ok(true)
}

/// Read the blob. A missing file is an empty map; an undecryptable file
/// is an empty map with a warning.
pub fn load(path: &Path, space_id: &str) -> SecretMap {
    let blob = match fs::read_to_string(path) {
        Ok(blob) => blob,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return SecretMap::new(),
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "failed to read secrets blob");
            return SecretMap::new();
        }
    };
    match decrypt(space_id, &blob) {
        Ok(map) => map,
        Err(_) => {
            tracing::warn!(path = %path.display(), "secrets blob failed to decrypt, starting empty");
            SecretMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SecretMap {
        let mut map = SecretMap::new();
        map.insert("openai".into(), "sk-123".into());
        map.insert("anthropic".into(), "sk-456".into());
        map
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let map = sample();
        let blob = encrypt("space-1", &map).unwrap();
        assert_eq!(decrypt("space-1", &blob).unwrap(), map);
    }

    #[test]
    fn fresh_iv_every_time() {
        let map = sample();
        assert_ne!(
            encrypt("space-1", &map).unwrap(),
            encrypt("space-1", &map).unwrap()
        );
    }

    #[test]
    fn wrong_space_id_fails_decrypt() {
        let blob = encrypt("space-1", &sample()).unwrap();
        assert!(matches!(
            decrypt("space-2", &blob),
            Err(SpaceError::SecretDecryptFailed)
        ));
    }

    #[test]
    fn tampered_blob_fails_decrypt() {
        let blob = encrypt("space-1", &sample()).unwrap();
        let mut bytes = BASE64.decode(blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = BASE64.encode(bytes);
        assert!(decrypt("space-1", &tampered).is_err());
    }

    #[test]
    fn load_tolerates_missing_and_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets");
        assert!(load(&path, "space-1").is_empty());

        fs::write(&path, "not base64 at all !!!").unwrap();
        assert!(load(&path, "space-1").is_empty());
    }

    #[test]
    fn save_skips_unchanged_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets");
        let map = sample();

        assert!(save(&path, "space-1", &map, None).unwrap());
        let on_disk = fs::read_to_string(&path).unwrap();

        assert!(!save(&path, "space-1", &map, Some(&map)).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), on_disk);

        let mut changed = map.clone();
        changed.insert("new".into(), "value".into());
        assert!(save(&path, "space-1", &changed, Some(&map)).unwrap());
    }
}
