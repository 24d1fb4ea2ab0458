//! Sealing of sensitive leaf values.
//!
//! Certificates and other secrets are stored in the namespace as a JSON
//! [`SealedValue`] envelope rather than as plaintext:
//!
//! ```text
//! { "header": { "cipher": "aes-256-gcm", "key_id": "<fingerprint>", "nonce": "<base64>" },
//!   "ciphertext": "<base64>" }
//! ```
//!
//! The header names the key that sealed the value so that opening with the
//! wrong key is reported as such instead of as a generic decryption failure.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Key length in bytes.
pub const KEY_SIZE: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_SIZE: usize = 12;
/// Cipher tag written into every envelope header.
pub const CIPHER: &str = "aes-256-gcm";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("malformed sealed value: {0}")]
    Malformed(String),

    #[error("sealed with key {found}, but the configured key is {expected}")]
    KeyMismatch { expected: String, found: String },

    #[error("failed to open sealed value")]
    OpenFailed,

    #[error("failed to seal value")]
    SealFailed,
}

/// Symmetric key for the secret box.
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Parse a hex-encoded 32 byte key.
    pub fn from_hex(s: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(s.trim()).map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
            SecretError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, b.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short public identifier: first 8 bytes of SHA-256 over the key, hex.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl FromStr for Key {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// Never print key material.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.fingerprint())
    }
}

/// Envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealHeader {
    pub cipher: String,
    pub key_id: String,
    /// Base64 nonce.
    pub nonce: String,
}

/// Encrypted envelope stored in place of a sensitive leaf value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedValue {
    pub header: SealHeader,
    /// Base64 ciphertext including the authentication tag.
    pub ciphertext: String,
}

impl SealedValue {
    pub fn from_json(bytes: &[u8]) -> Result<Self, SecretError> {
        serde_json::from_slice(bytes).map_err(|e| SecretError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, SecretError> {
        serde_json::to_string(self).map_err(|e| SecretError::Malformed(e.to_string()))
    }
}

/// Seals and opens values with one symmetric key.
pub struct SecretBox {
    cipher: Aes256Gcm,
    key_id: String,
}

impl SecretBox {
    pub fn new(key: &Key) -> Self {
        Self {
            cipher: Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&key.0)),
            key_id: key.fingerprint(),
        }
    }

    /// Fingerprint of the key this box seals with.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedValue, SecretError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SecretError::SealFailed)?;

        Ok(SealedValue {
            header: SealHeader {
                cipher: CIPHER.to_string(),
                key_id: self.key_id.clone(),
                nonce: STANDARD.encode(nonce),
            },
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    pub fn open(&self, sealed: &SealedValue) -> Result<Vec<u8>, SecretError> {
        if sealed.header.cipher != CIPHER {
            return Err(SecretError::Malformed(format!(
                "unsupported cipher '{}'",
                sealed.header.cipher
            )));
        }
        if sealed.header.key_id != self.key_id {
            return Err(SecretError::KeyMismatch {
                expected: self.key_id.clone(),
                found: sealed.header.key_id.clone(),
            });
        }

        let nonce = STANDARD
            .decode(&sealed.header.nonce)
            .map_err(|e| SecretError::Malformed(format!("nonce: {}", e)))?;
        if nonce.len() != NONCE_SIZE {
            return Err(SecretError::Malformed(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|e| SecretError::Malformed(format!("ciphertext: {}", e)))?;

        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| SecretError::OpenFailed)
    }
}

impl fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBox").field("key_id", &self.key_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let secrets = SecretBox::new(&Key::generate());
        let sealed = secrets.seal(b"-----BEGIN CERTIFICATE-----").unwrap();
        assert_eq!(sealed.header.cipher, CIPHER);
        assert_eq!(secrets.open(&sealed).unwrap(), b"-----BEGIN CERTIFICATE-----");
    }

    #[test]
    fn opening_with_another_key_fails() {
        let sealed = SecretBox::new(&Key::generate()).seal(b"secret").unwrap();
        let other = SecretBox::new(&Key::generate());
        assert!(matches!(other.open(&sealed), Err(SecretError::KeyMismatch { .. })));
    }

    #[test]
    fn forged_key_id_still_fails_authentication() {
        let sealed = SecretBox::new(&Key::generate()).seal(b"secret").unwrap();
        let other = SecretBox::new(&Key::generate());
        let mut forged = sealed.clone();
        forged.header.key_id = other.key_id().to_string();
        assert_eq!(other.open(&forged), Err(SecretError::OpenFailed));
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let secrets = SecretBox::new(&Key::generate());
        assert!(matches!(
            SealedValue::from_json(b"not json"),
            Err(SecretError::Malformed(_))
        ));

        let mut sealed = secrets.seal(b"x").unwrap();
        sealed.header.nonce = "AAAA".to_string();
        assert!(matches!(secrets.open(&sealed), Err(SecretError::Malformed(_))));
    }

    #[test]
    fn envelope_survives_json() {
        let secrets = SecretBox::new(&Key::generate());
        let json = secrets.seal(b"payload").unwrap().to_json().unwrap();
        let parsed = SealedValue::from_json(json.as_bytes()).unwrap();
        assert_eq!(secrets.open(&parsed).unwrap(), b"payload");
    }

    #[test]
    fn keys_parse_from_hex() {
        let key = Key::generate();
        let parsed: Key = key.to_hex().parse().unwrap();
        assert_eq!(parsed, key);
        assert!(matches!(Key::from_hex("abcd"), Err(SecretError::InvalidKey(_))));
        assert!(matches!(Key::from_hex("zz"), Err(SecretError::InvalidKey(_))));
        assert!(!format!("{:?}", key).contains(&key.to_hex()));
    }
}
