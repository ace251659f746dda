//! Credential vault: symmetric encryption for the API secret and SSH
//! passwords, keyed by a persisted machine key.
//!
//! Key resolution order: explicit override from the environment, then the
//! persisted key file, then generate-once-and-persist. The persist step uses
//! an atomic create-new open so two processes racing on first use cannot
//! both generate a key; the loser reads the winner's file. Once a key file
//! exists it is never regenerated — regenerating would strand every secret
//! encrypted so far, so a mismatched key fails decryption loudly instead.

use crate::crypto::{self, KEY_LEN, NONCE_LEN};
use crate::error::VaultError;
use base64::{engine::general_purpose, Engine as _};
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

/// Environment override: base64 of a 32-byte key.
pub const KEY_ENV: &str = "CERTSYNC_VAULT_KEY";

pub struct CredentialVault {
    key: Zeroizing<Vec<u8>>,
}

impl CredentialVault {
    /// Open the vault against the key file at `key_file`, generating and
    /// persisting a key on first use.
    pub fn open(key_file: &Path) -> Result<Self, VaultError> {
        if let Ok(raw) = std::env::var(KEY_ENV) {
            if !raw.trim().is_empty() {
                let key = decode_key(raw.trim())?;
                return Ok(Self { key });
            }
        }
        match std::fs::read_to_string(key_file) {
            Ok(contents) => {
                let key = decode_key(contents.trim())?;
                Ok(Self { key })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::generate_at(key_file),
            Err(e) => Err(VaultError::Unavailable(format!(
                "reading key file {}: {e}",
                key_file.display()
            ))),
        }
    }

    /// Build a vault around an existing key. Used by tests and by callers
    /// that manage key material themselves.
    pub fn with_key(key: Zeroizing<Vec<u8>>) -> Result<Self, VaultError> {
        if key.len() != KEY_LEN {
            return Err(VaultError::Unavailable(format!(
                "key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self { key })
    }

    fn generate_at(key_file: &Path) -> Result<Self, VaultError> {
        if let Some(parent) = key_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VaultError::Unavailable(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let key = crypto::generate_key();
        let encoded = general_purpose::STANDARD.encode(&*key);

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        match options.open(key_file) {
            Ok(mut file) => {
                file.write_all(encoded.as_bytes())
                    .and_then(|_| file.flush())
                    .map_err(|e| {
                        VaultError::Unavailable(format!(
                            "writing key file {}: {e}",
                            key_file.display()
                        ))
                    })?;
                tracing::info!(path = %key_file.display(), "generated new vault key");
                Ok(Self { key })
            }
            // Lost the create race: another process persisted first. Use its key.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let contents = std::fs::read_to_string(key_file).map_err(|e| {
                    VaultError::Unavailable(format!(
                        "reading key file {}: {e}",
                        key_file.display()
                    ))
                })?;
                let key = decode_key(contents.trim())?;
                Ok(Self { key })
            }
            Err(e) => Err(VaultError::Unavailable(format!(
                "creating key file {}: {e}",
                key_file.display()
            ))),
        }
    }

    /// Encrypt `plaintext` into a self-contained base64 token
    /// (nonce followed by ciphertext).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let nonce = crypto::generate_nonce();
        let ciphertext = crypto::encrypt(&self.key, &nonce, plaintext)
            .map_err(|e| VaultError::Unavailable(e.to_string()))?;
        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(raw))
    }

    /// Decrypt a token produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, token: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let raw = general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|_| VaultError::Decryption)?;
        if raw.len() < NONCE_LEN {
            return Err(VaultError::Decryption);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| VaultError::Decryption)?;
        let plaintext =
            crypto::decrypt(&self.key, &nonce, ciphertext).map_err(|_| VaultError::Decryption)?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Decrypt a token that is known to hold UTF-8 (passwords, API secrets).
    pub fn decrypt_string(&self, token: &str) -> Result<Zeroizing<String>, VaultError> {
        let bytes = self.decrypt(token)?;
        let text = std::str::from_utf8(&bytes).map_err(|_| VaultError::Decryption)?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

fn decode_key(encoded: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let key = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| VaultError::Unavailable(format!("key is not valid base64: {e}")))?;
    if key.len() != KEY_LEN {
        return Err(VaultError::Unavailable(format!(
            "key must be {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(Zeroizing::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_including_empty() {
        let dir = tempdir().unwrap();
        let vault = CredentialVault::open(&dir.path().join("vault.key")).unwrap();
        for plaintext in [&b""[..], b"p", b"hunter2", &[0u8, 255, 1, 2][..]] {
            let token = vault.encrypt(plaintext).unwrap();
            assert_eq!(&*vault.decrypt(&token).unwrap(), plaintext);
        }
    }

    #[test]
    fn fresh_nonce_per_encrypt() {
        let dir = tempdir().unwrap();
        let vault = CredentialVault::open(&dir.path().join("vault.key")).unwrap();
        let a = vault.encrypt(b"same").unwrap();
        let b = vault.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_persists_across_opens() {
        let dir = tempdir().unwrap();
        let key_file = dir.path().join("vault.key");
        let token = CredentialVault::open(&key_file)
            .unwrap()
            .encrypt(b"persisted")
            .unwrap();
        let reopened = CredentialVault::open(&key_file).unwrap();
        assert_eq!(&*reopened.decrypt(&token).unwrap(), b"persisted");
    }

    #[test]
    fn wrong_key_is_a_decryption_error() {
        let dir = tempdir().unwrap();
        let token = CredentialVault::open(&dir.path().join("a.key"))
            .unwrap()
            .encrypt(b"secret")
            .unwrap();
        let other = CredentialVault::open(&dir.path().join("b.key")).unwrap();
        assert!(matches!(
            other.decrypt(&token),
            Err(VaultError::Decryption)
        ));
        assert!(matches!(
            other.decrypt_string(&token),
            Err(VaultError::Decryption)
        ));
    }

    #[test]
    fn corrupt_token_is_a_decryption_error() {
        let dir = tempdir().unwrap();
        let vault = CredentialVault::open(&dir.path().join("vault.key")).unwrap();
        assert!(matches!(
            vault.decrypt("not base64 at all!"),
            Err(VaultError::Decryption)
        ));
        assert!(matches!(vault.decrypt("AAAA"), Err(VaultError::Decryption)));
    }
}
