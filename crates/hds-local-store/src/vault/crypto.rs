//! Key derivation and authenticated encryption.
//!
//! Argon2id turns the password into a 256-bit key; XChaCha20-Poly1305 seals
//! every blob with a fresh random 192-bit nonce.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::VaultError;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
/// Argon2 rejects shorter salts.
pub const MIN_SALT_LEN: usize = 8;
pub const NONCE_LEN: usize = 24;

/// Ceilings on accepted KDF cost. Backups declare their own parameters, so
/// these bound the work an untrusted file can demand.
pub const MAX_MEMORY_KIB: u32 = 256 * 1024;
pub const MAX_ITERATIONS: u32 = 16;
pub const MAX_PARALLELISM: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.memory_kib > MAX_MEMORY_KIB
            || self.iterations > MAX_ITERATIONS
            || self.parallelism > MAX_PARALLELISM
        {
            return Err(VaultError::Validation(format!(
                "Argon2 parameters exceed limits (memory <= {} KiB, iterations <= {}, parallelism <= {})",
                MAX_MEMORY_KIB, MAX_ITERATIONS, MAX_PARALLELISM
            )));
        }
        self.to_argon2().map(|_| ())
    }

    fn to_argon2(self) -> Result<Params, VaultError> {
        Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_LEN))
            .map_err(|e| VaultError::Validation(format!("invalid Argon2 parameters: {}", e)))
    }
}

/// Symmetric key held only in memory and wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub fn derive_key(password: &str, salt: &[u8], params: KdfParams) -> Result<DerivedKey, VaultError> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);
    let mut key = DerivedKey([0u8; KEY_LEN]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut key.0)
        .map_err(|e| VaultError::Crypto(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

/// Runs [`derive_key`] on the blocking pool.
pub async fn derive_key_async(
    password: &str,
    salt: Vec<u8>,
    params: KdfParams,
) -> Result<DerivedKey, VaultError> {
    let password = Zeroizing::new(password.to_string());
    tokio::task::spawn_blocking(move || derive_key(&password, &salt, params))
        .await
        .map_err(|e| VaultError::Crypto(format!("key derivation task failed: {}", e)))?
}

/// Nonce and ciphertext, base64 encoded for JSON storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    pub nonce: String,
    pub ciphertext: String,
}

pub fn seal(key: &DerivedKey, plaintext: &[u8], aad: &[u8]) -> Result<SealedBlob, VaultError> {
    let cipher = XChaCha20Poly1305::new_from_slice(&key.0)
        .map_err(|e| VaultError::Crypto(e.to_string()))?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::Crypto("encryption failed".into()))?;
    Ok(SealedBlob {
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Malformed encoding is an integrity error; a failed tag check is an
/// authentication error.
pub fn open(key: &DerivedKey, blob: &SealedBlob, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let nonce = decode_b64("nonce", &blob.nonce)?;
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Integrity(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }
    let ciphertext = decode_b64("ciphertext", &blob.ciphertext)?;

    let cipher = XChaCha20Poly1305::new_from_slice(&key.0)
        .map_err(|e| VaultError::Crypto(e.to_string()))?;
    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| VaultError::Authentication)
}

pub fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, VaultError> {
    BASE64
        .decode(value)
        .map_err(|e| VaultError::Integrity(format!("{} is not valid base64: {}", field, e)))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}
