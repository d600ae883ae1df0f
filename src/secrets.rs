//! Opaque encrypt/decrypt capability for stored credentials.
//!
//! Access tokens, refresh tokens, and BYOA client secrets are never persisted
//! in plaintext. The codec is injected so tests can substitute a trivial
//! implementation without touching key material.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore as _;
use sha2::{Digest, Sha256};

use crate::errors::SecretsError;

pub trait SecretsCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError>;
    fn decrypt(&self, payload: &str) -> Result<String, SecretsError>;
}

/// AES-256-GCM codec with a random 12-byte nonce per value.
///
/// Payload format: `v1.<nonce_b64>.<ciphertext_b64>` where the ciphertext
/// carries the GCM tag. Key material is either a base64-encoded 32-byte key
/// or an arbitrary passphrase hashed down to 32 bytes.
pub struct AesGcmCodec {
    key: [u8; 32],
}

impl AesGcmCodec {
    pub fn new(key_material: &str) -> Self {
        let key = match B64.decode(key_material.as_bytes()) {
            Ok(decoded) if decoded.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&decoded);
                key
            }
            _ => {
                let mut hasher = Sha256::new();
                hasher.update(key_material.as_bytes());
                hasher.finalize().into()
            }
        };
        Self { key }
    }
}

impl SecretsCodec for AesGcmCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|e| SecretsError::EncryptFailed {
                details: e.to_string(),
            })?;

        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).map_err(|e| {
            SecretsError::EncryptFailed {
                details: e.to_string(),
            }
        })?;

        Ok(format!(
            "v1.{}.{}",
            B64.encode(nonce_bytes),
            B64.encode(ciphertext)
        ))
    }

    fn decrypt(&self, payload: &str) -> Result<String, SecretsError> {
        let mut parts = payload.splitn(3, '.');
        let (version, nonce_b64, ct_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(n), Some(c)) => (v, n, c),
            _ => return Err(SecretsError::InvalidPayload),
        };
        if version != "v1" {
            return Err(SecretsError::InvalidPayload);
        }

        let nonce_bytes = B64
            .decode(nonce_b64.as_bytes())
            .map_err(|_| SecretsError::InvalidPayload)?;
        let ciphertext = B64
            .decode(ct_b64.as_bytes())
            .map_err(|_| SecretsError::InvalidPayload)?;
        if nonce_bytes.len() != 12 {
            return Err(SecretsError::InvalidPayload);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|e| SecretsError::DecryptFailed {
                details: e.to_string(),
            })?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext =
            cipher
                .decrypt(nonce, ciphertext.as_ref())
                .map_err(|e| SecretsError::DecryptFailed {
                    details: e.to_string(),
                })?;

        String::from_utf8(plaintext).map_err(|_| SecretsError::InvalidPayload)
    }
}
