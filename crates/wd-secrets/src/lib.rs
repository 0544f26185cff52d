//! Agent credential material.
//!
//! Agents present an api key of the form `<agent-uuid>:<64-hex-secret>`. The
//! uuid prefix gives O(1) row lookup; the secret half is stored AES-256-GCM
//! encrypted under a 32-byte process key and compared in constant time on
//! every handshake.

#![forbid(unsafe_code)]

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;
use wd_proto::EncryptedSecret;

/// Hex length of the plaintext agent secret (32 random bytes).
pub const SECRET_HEX_LEN: usize = 64;
/// Hex length of the process key (32 bytes).
pub const PROCESS_KEY_HEX_LEN: usize = 64;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("process key must be {PROCESS_KEY_HEX_LEN} hex chars")]
    InvalidProcessKey,
    #[error("api key is not <uuid>:<{SECRET_HEX_LEN}-hex>")]
    InvalidApiKey,
    #[error("secret was encrypted with key version {stored}, process key is version {current}")]
    KeyVersionMismatch { stored: u32, current: u32 },
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("cipher rejected the payload")]
    Crypto,
}

// ─── Process key ─────────────────────────────────────────────────────────────

/// The hub's AES-256-GCM key, loaded once at startup.
pub struct ProcessKey {
    cipher: Aes256Gcm,
    version: u32,
    fingerprint: String,
}

impl ProcessKey {
    /// Build from a 64-hex-char key string.
    pub fn from_hex(hex_key: &str, version: u32) -> Result<Self, SecretError> {
        if hex_key.len() != PROCESS_KEY_HEX_LEN {
            return Err(SecretError::InvalidProcessKey);
        }
        let bytes = hex::decode(hex_key).map_err(|_| SecretError::InvalidProcessKey)?;
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        let digest = Sha256::digest(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
            version,
            // Short digest prefix, safe to log.
            fingerprint: hex::encode(&digest[..6]),
        })
    }

    /// Generate a fresh key; returns the instance and its hex form for the
    /// operator to store.
    pub fn generate(version: u32) -> (Self, String) {
        let hex_key = hex::encode(Aes256Gcm::generate_key(&mut OsRng));
        let key = Self::from_hex(&hex_key, version)
            .unwrap_or_else(|_| unreachable!("generated key is always valid hex"));
        (key, hex_key)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Short digest prefix identifying the key in logs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt an agent secret for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Crypto)?;
        Ok(EncryptedSecret {
            ciphertext: B64.encode(ciphertext),
            nonce: B64.encode(nonce),
            key_version: self.version,
        })
    }

    /// Decrypt a stored agent secret.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, SecretError> {
        if secret.key_version != self.version {
            return Err(SecretError::KeyVersionMismatch {
                stored: secret.key_version,
                current: self.version,
            });
        }
        let nonce_bytes = B64
            .decode(&secret.nonce)
            .map_err(|e| SecretError::Encoding(e.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(SecretError::Encoding(format!(
                "nonce is {} bytes, expected {NONCE_LEN}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = B64
            .decode(&secret.ciphertext)
            .map_err(|e| SecretError::Encoding(e.to_string()))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| SecretError::Crypto)?;
        String::from_utf8(plaintext).map_err(|e| SecretError::Encoding(e.to_string()))
    }
}

impl std::fmt::Debug for ProcessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessKey")
            .field("version", &self.version)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

// ─── Api key ─────────────────────────────────────────────────────────────────

/// A parsed agent api key.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub agent_id: Uuid,
    pub secret: String,
}

/// Parse `<agent-uuid>:<64-hex-secret>`.
pub fn parse_api_key(raw: &str) -> Result<ApiKey, SecretError> {
    let (id_part, secret_part) = raw.split_once(':').ok_or(SecretError::InvalidApiKey)?;
    let agent_id = Uuid::parse_str(id_part).map_err(|_| SecretError::InvalidApiKey)?;
    if secret_part.len() != SECRET_HEX_LEN
        || !secret_part.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(SecretError::InvalidApiKey);
    }
    Ok(ApiKey {
        agent_id,
        secret: secret_part.to_string(),
    })
}

/// Generate a fresh 64-hex agent secret (32 random bytes).
pub fn generate_agent_secret() -> String {
    hex::encode(Aes256Gcm::generate_key(&mut OsRng))
}

/// Constant-time comparison of a presented secret against the decrypted
/// stored one.
///
/// Both sides are reduced to fixed-width SHA-256 digests first, so neither
/// length nor prefix structure shapes the comparison time.
pub fn verify_secret(presented: &str, stored: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(stored.as_bytes());
    a.ct_eq(&b).into()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
