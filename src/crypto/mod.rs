//! Security filter: container permission checks, per-container key setup,
//! and sensitive-block encryption.
//!
//! Key hierarchy:
//!   master key    = Argon2id(password, salt = file salt)
//!   container key = BLAKE3-keyed(master key, container salt ‖ container id)
//!
//! Encryption is AES-256-GCM with the container id (LE u32) as associated
//! data, so a block moved into another container fails authentication.
//!
//! Encrypted payload layout: [ nonce (12 B) | ciphertext | GCM tag (16 B) ]

use std::io;
use std::path::Path;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Byte length of the AES-GCM nonce prepended to every encrypted payload.
pub const NONCE_LEN: usize = 12;

/// BLAKE3 domain separation for container keys.
const CONTAINER_KEY_CONTEXT: &[u8] = b"secram container key v1";

#[derive(Error, Debug)]
pub enum CryptoError {
    /// A primitive the filter needs is missing from this runtime.
    #[error("Cryptographic algorithm unavailable: {0}")]
    AlgorithmUnavailable(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Container {container_id} has no initialised encryption context")]
    NotInitialized { container_id: u32 },
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: wrong key or container, or corrupted data")]
    DecryptionFailed,
    #[error("Encrypted payload too short (minimum {NONCE_LEN} bytes)")]
    TooShort,
}

// ── SecurityFilter ────────────────────────────────────────────────────────────

/// Decides which containers a reader may see and decrypts their sensitive
/// block.
///
/// Callers must check [`is_container_permitted`](Self::is_container_permitted)
/// before calling [`init_container_encryption`](Self::init_container_encryption)
/// for a container, and must initialise before decrypting.
pub trait SecurityFilter {
    fn is_container_permitted(&self, absolute_pos_start: u64) -> bool;

    /// Set up the key material for one container.  Fails with
    /// [`CryptoError::AlgorithmUnavailable`] or [`CryptoError::KeyDerivation`]
    /// when the environment cannot provide it.
    fn init_container_encryption(&mut self, container_salt: u64, container_id: u32) -> Result<(), CryptoError>;

    fn decrypt_block(&self, ciphertext: &[u8], container_id: u32) -> Result<Vec<u8>, CryptoError>;
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Half-open range of absolute positions, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRange {
    pub start: u64,
    pub end:   u64,
}

impl PositionRange {
    #[inline]
    pub fn contains(&self, pos: u64) -> bool {
        self.start <= pos && pos < self.end
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib:  u32,
    pub iterations:  u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { memory_kib: 64 * 1024, iterations: 3, parallelism: 1 }
    }
}

/// Filter configuration, loadable from JSON:
///
/// ```json
/// { "permitted": [ { "start": 0, "end": 1000000 } ],
///   "kdf": { "memory_kib": 65536, "iterations": 3, "parallelism": 1 } }
/// ```
///
/// An empty `permitted` list admits every position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub permitted: Vec<PositionRange>,
    #[serde(default)]
    pub kdf:       KdfParams,
}

impl FilterConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn is_permitted(&self, pos: u64) -> bool {
        self.permitted.is_empty() || self.permitted.iter().any(|r| r.contains(pos))
    }
}

// ── Primitives ────────────────────────────────────────────────────────────────

/// Derive a 256-bit master key from a password and the file salt.
pub fn derive_key(password: &str, salt: &[u8], kdf: &KdfParams) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Fresh container salt from the OS RNG.  Container salts are stored in
/// the clear, so they must not be derived from the payload.
pub fn random_salt() -> u64 {
    AeadOsRng.next_u64()
}

/// Derive the key for one container from the master key.
pub fn derive_container_key(master: &[u8; 32], container_salt: u64, container_id: u32) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(master);
    hasher.update(CONTAINER_KEY_CONTEXT);
    hasher.update(&container_salt.to_le_bytes());
    hasher.update(&container_id.to_le_bytes());
    hasher.finalize().into()
}

/// Encrypt `plaintext` with AES-256-GCM under a random nonce, binding `aad`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::AlgorithmUnavailable(e.to_string()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`] with the same `aad`.
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::TooShort);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::AlgorithmUnavailable(e.to_string()))?;
    let nonce = aes_gcm::Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, Payload { msg: &data[NONCE_LEN..], aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

// ── KeyedFilter ───────────────────────────────────────────────────────────────

/// Password-keyed [`SecurityFilter`] with position-range permissions.
///
/// Holds the context of one container at a time; initialising the next
/// container replaces it.
pub struct KeyedFilter {
    master_key: [u8; 32],
    config:     FilterConfig,
    current:    Option<(u32, [u8; 32])>,
}

impl KeyedFilter {
    pub fn new(master_key: [u8; 32], config: FilterConfig) -> Self {
        Self { master_key, config, current: None }
    }

    pub fn from_password(password: &str, file_salt: u64, config: FilterConfig) -> Result<Self, CryptoError> {
        let master_key = derive_key(password, &file_salt.to_le_bytes(), &config.kdf)?;
        Ok(Self::new(master_key, config))
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Writer-side counterpart of [`SecurityFilter::decrypt_block`].
    pub fn encrypt_block(&self, plaintext: &[u8], container_id: u32) -> Result<Vec<u8>, CryptoError> {
        encrypt(self.key_for(container_id)?, plaintext, &container_id.to_le_bytes())
    }

    fn key_for(&self, container_id: u32) -> Result<&[u8; 32], CryptoError> {
        match &self.current {
            Some((id, key)) if *id == container_id => Ok(key),
            _ => Err(CryptoError::NotInitialized { container_id }),
        }
    }
}

impl SecurityFilter for KeyedFilter {
    fn is_container_permitted(&self, absolute_pos_start: u64) -> bool {
        self.config.is_permitted(absolute_pos_start)
    }

    fn init_container_encryption(&mut self, container_salt: u64, container_id: u32) -> Result<(), CryptoError> {
        let key = derive_container_key(&self.master_key, container_salt, container_id);
        debug!(container_id, "container encryption initialised");
        self.current = Some((container_id, key));
        Ok(())
    }

    fn decrypt_block(&self, ciphertext: &[u8], container_id: u32) -> Result<Vec<u8>, CryptoError> {
        decrypt(self.key_for(container_id)?, ciphertext, &container_id.to_le_bytes())
    }
}
