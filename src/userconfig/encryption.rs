//! Encrypted-at-rest secret storage.
//!
//! AES-256-GCM with a 12-byte nonce and 16-byte tag; the stored form is
//! `base64(nonce || tag || ciphertext)`. Key material is 32 bytes resolved
//! from `ENCRYPTION_KEY` (base64 or raw) with a deterministic development
//! fallback. Decryption lives on the blob type; plaintext keys never leave
//! the resolver layer except on an outgoing LLM-config record.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::Engine;

use crate::error::{AgentError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// An AES-256-GCM sealed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    nonce: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Seal a plaintext under the key. The nonce is random, so two seals of
    /// the same plaintext differ.
    pub fn encrypt(plaintext: &str, key: &[u8; 32]) -> Result<Self> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| AgentError::Config("encryption failed".to_string()))?;

        // The AEAD output is ciphertext || tag.
        let split = sealed.len().saturating_sub(TAG_LEN);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&sealed[split..]);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&nonce);

        Ok(Self {
            nonce: nonce_bytes,
            tag,
            ciphertext: sealed[..split].to_vec(),
        })
    }

    /// Open the blob. A wrong key or tampered payload fails cleanly.
    pub fn decrypt(&self, key: &[u8; 32]) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let mut sealed = self.ciphertext.clone();
        sealed.extend_from_slice(&self.tag);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), sealed.as_slice())
            .map_err(|_| AgentError::Config("decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| AgentError::Config("decrypted payload is not UTF-8".to_string()))
    }

    /// Stored form: `base64(nonce || tag || ciphertext)`.
    pub fn encode(&self) -> String {
        let mut combined = Vec::with_capacity(NONCE_LEN + TAG_LEN + self.ciphertext.len());
        combined.extend_from_slice(&self.nonce);
        combined.extend_from_slice(&self.tag);
        combined.extend_from_slice(&self.ciphertext);
        base64::engine::general_purpose::STANDARD.encode(combined)
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| AgentError::Config("invalid base64 in encrypted value".to_string()))?;
        if combined.len() < NONCE_LEN + TAG_LEN {
            return Err(AgentError::Config(
                "encrypted value too short".to_string(),
            ));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&combined[..NONCE_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&combined[NONCE_LEN..NONCE_LEN + TAG_LEN]);
        Ok(Self {
            nonce,
            tag,
            ciphertext: combined[NONCE_LEN + TAG_LEN..].to_vec(),
        })
    }
}

/// Convenience: seal and encode in one step. Empty plaintexts stay empty.
pub fn encrypt_value(plaintext: &str, key: &[u8; 32]) -> Result<String> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }
    Ok(EncryptedBlob::encrypt(plaintext, key)?.encode())
}

/// Convenience: decode and open in one step. Empty inputs stay empty.
pub fn decrypt_value(encoded: &str, key: &[u8; 32]) -> Result<String> {
    if encoded.is_empty() {
        return Ok(String::new());
    }
    EncryptedBlob::decode(encoded)?.decrypt(key)
}

/// Resolve the 32-byte key from `ENCRYPTION_KEY`: base64 first, then the
/// raw string padded or truncated to 32 bytes. Unset falls back to a fixed
/// development key.
pub fn resolve_key() -> [u8; 32] {
    match std::env::var("ENCRYPTION_KEY") {
        Ok(value) if !value.is_empty() => {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(&value) {
                if decoded.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&decoded);
                    return key;
                }
            }
            pad_to_key(value.as_bytes())
        }
        _ => pad_to_key(b"dev-encryption-key-32-bytes!!"),
    }
}

fn pad_to_key(bytes: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    let take = bytes.len().min(32);
    key[..take].copy_from_slice(&bytes[..take]);
    key
}

/// Fresh random key in the stored (base64) form.
pub fn generate_key() -> String {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    base64::engine::general_purpose::STANDARD.encode(key)
}
