//! Symmetric encryption of secret values at rest.
//!
//! AES-256-GCM with a key derived by SHA-256 from the configured secret. A
//! fresh 96-bit nonce is drawn for every seal. Sealed format:
//! `hex(nonce) + ":" + hex(ciphertext || tag)`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::ServiceError;

pub const MIN_SECRET_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SEPARATOR: char = ':';

#[derive(Clone)]
pub struct Cipher {
    key: Arc<Key<Aes256Gcm>>,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Fails when the configured secret is shorter than [`MIN_SECRET_LEN`].
    pub fn new(secret: &str) -> Result<Self, anyhow::Error> {
        if secret.chars().count() < MIN_SECRET_LEN {
            anyhow::bail!(
                "Encryption key must be at least {} characters long",
                MIN_SECRET_LEN
            );
        }

        let digest = Sha256::digest(secret.as_bytes());
        Ok(Self {
            key: Arc::new(Key::<Aes256Gcm>::clone_from_slice(&digest)),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, ServiceError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = Aes256Gcm::new(&self.key)
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| {
                tracing::error!("Secret encryption failed");
                ServiceError::Encryption
            })?;

        Ok(format!(
            "{}{}{}",
            hex::encode(nonce_bytes),
            SEPARATOR,
            hex::encode(ciphertext)
        ))
    }

    pub fn open(&self, sealed: &str) -> Result<String, ServiceError> {
        let (nonce_hex, ciphertext_hex) =
            sealed.split_once(SEPARATOR).ok_or(ServiceError::Decryption)?;

        let nonce_bytes = hex::decode(nonce_hex).map_err(|_| ServiceError::Decryption)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(ServiceError::Decryption);
        }
        let ciphertext = hex::decode(ciphertext_hex).map_err(|_| ServiceError::Decryption)?;

        let plaintext = Aes256Gcm::new(&self.key)
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| {
                tracing::warn!("Secret decryption failed");
                ServiceError::Decryption
            })?;

        String::from_utf8(plaintext).map_err(|_| ServiceError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn rejects_short_keys() {
        assert!(Cipher::new("too-short").is_err());
        assert!(Cipher::new(&"k".repeat(31)).is_err());
        assert!(Cipher::new(&"k".repeat(32)).is_ok());
    }

    #[test]
    fn open_reverses_seal() {
        let cipher = Cipher::new(KEY).unwrap();
        for plaintext in ["x", "postgres://user:pass@db/app", "ünïcødé 🔑", " padded "] {
            let sealed = cipher.seal(plaintext).unwrap();
            assert_eq!(cipher.open(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn seal_uses_fresh_nonce() {
        let cipher = Cipher::new(KEY).unwrap();
        let first = cipher.seal("same input").unwrap();
        let second = cipher.seal("same input").unwrap();

        assert_ne!(first, second);
        assert_eq!(cipher.open(&first).unwrap(), "same input");
        assert_eq!(cipher.open(&second).unwrap(), "same input");
    }

    #[test]
    fn sealed_format_is_hex_nonce_and_ciphertext() {
        let cipher = Cipher::new(KEY).unwrap();
        let sealed = cipher.seal("value").unwrap();
        let (nonce, body) = sealed.split_once(':').unwrap();

        assert_eq!(nonce.len(), NONCE_LEN * 2);
        assert!(hex::decode(nonce).is_ok());
        assert!(hex::decode(body).is_ok());
        assert!(!sealed.contains("value"));
    }

    #[test]
    fn malformed_input_is_a_decryption_error() {
        let cipher = Cipher::new(KEY).unwrap();
        for sealed in ["", "no-separator", "zz:00", "00:zz", "0011:aabb"] {
            assert!(matches!(cipher.open(sealed), Err(ServiceError::Decryption)));
        }
    }

    #[test]
    fn tampering_or_wrong_key_fails() {
        let cipher = Cipher::new(KEY).unwrap();
        let sealed = cipher.seal("top secret").unwrap();

        let mut tampered = sealed.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert!(matches!(cipher.open(&tampered), Err(ServiceError::Decryption)));

        let other = Cipher::new("fedcba9876543210fedcba9876543210").unwrap();
        assert!(matches!(other.open(&sealed), Err(ServiceError::Decryption)));
    }
}
