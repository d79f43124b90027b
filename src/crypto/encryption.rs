//! Password-based parameter encryption
//!
//! Both sides derive the same AES-256-GCM key from a shared password with
//! PBKDF2-HMAC-SHA256 over a fixed protocol salt. Each value gets a fresh
//! random nonce; the wire form is lowercase hex of `nonce || ciphertext`.

use crate::error::{FilegateError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::Sha256;

/// Salt shared by every client and server speaking this protocol
const PROTOCOL_SALT: &[u8] = b"filegate.parameters.v1";

/// PBKDF2 iteration count
const PBKDF2_ROUNDS: u32 = 4096;

/// AES-GCM nonce size in bytes
const NONCE_SIZE: usize = 12;

/// AES-GCM tag size in bytes
const TAG_SIZE: usize = 16;

/// Derived parameter key
#[derive(Clone)]
pub struct ParamKey {
    key: [u8; 32],
}

impl ParamKey {
    /// Derive key from password
    pub fn from_password(password: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), PROTOCOL_SALT, PBKDF2_ROUNDS, &mut key);
        Self { key }
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for ParamKey {
    fn drop(&mut self) {
        // Zero out key on drop
        for byte in &mut self.key {
            *byte = 0;
        }
    }
}

impl std::fmt::Debug for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ParamKey(..)")
    }
}

/// Symmetric cipher for individual parameter values
#[derive(Clone, Debug)]
pub struct ParamCipher {
    key: ParamKey,
}

impl ParamCipher {
    /// Create a cipher from the shared password
    pub fn from_password(password: &str) -> Self {
        Self {
            key: ParamKey::from_password(password),
        }
    }

    fn aead(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.as_bytes())
            .map_err(|e| FilegateError::CryptoError(e.to_string()))
    }

    /// Encrypt a value into its hex wire form
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .aead()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| FilegateError::CryptoError("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypt a hex wire value
    ///
    /// Fails when the value was encrypted under a different password or was
    /// altered in transit.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| FilegateError::CryptoError(format!("invalid hex: {}", e)))?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(FilegateError::CryptoError("encrypted value too short".into()));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .aead()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| FilegateError::CryptoError("authentication failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| FilegateError::CryptoError("decrypted value is not UTF-8".into()))
    }
}
