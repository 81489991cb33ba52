//! Self-describing backup envelope.
//!
//! ```json
//! {
//!   "format": "hds-vault-backup",
//!   "version": 1,
//!   "created_at": "2026-01-05T09:00:00.000000Z",
//!   "record_counts": { "patients": 2 },
//!   "kdf": { "memory_kib": 19456, "iterations": 2, "parallelism": 1 },
//!   "salt": "<base64>",
//!   "nonce": "<base64>",
//!   "ciphertext": "<base64>",
//!   "checksum": "<blake3 hex over every field above>"
//! }
//! ```
//!
//! [`BackupEnvelope::parse`] checks format, version, checksum and the KDF
//! cost ceilings, so a corrupted or hostile file is rejected before any key
//! derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::VaultError;
use crate::vault::crypto::{decode_b64, KdfParams, SealedBlob, MIN_SALT_LEN, NONCE_LEN};

pub const BACKUP_FORMAT: &str = "hds-vault-backup";
pub const BACKUP_VERSION: u32 = 1;
pub(crate) const BACKUP_AAD: &[u8] = b"hds-vault-backup/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEnvelope {
    pub format: String,
    pub version: u32,
    pub created_at: String,
    pub record_counts: BTreeMap<String, usize>,
    pub kdf: KdfParams,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
    pub checksum: String,
}

/// Fields covered by the checksum, in envelope order.
#[derive(Serialize)]
struct ChecksumFields<'a> {
    format: &'a str,
    version: u32,
    created_at: &'a str,
    record_counts: &'a BTreeMap<String, usize>,
    kdf: &'a KdfParams,
    salt: &'a str,
    nonce: &'a str,
    ciphertext: &'a str,
}

/// Decrypted backup contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub entities: BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub version: u32,
    pub created_at: String,
    pub record_counts: BTreeMap<String, usize>,
    pub total_records: usize,
}

impl BackupEnvelope {
    pub fn seal(
        created_at: String,
        record_counts: BTreeMap<String, usize>,
        kdf: KdfParams,
        salt: String,
        sealed: SealedBlob,
    ) -> Result<Self, VaultError> {
        let mut envelope = Self {
            format: BACKUP_FORMAT.to_string(),
            version: BACKUP_VERSION,
            created_at,
            record_counts,
            kdf,
            salt,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            checksum: String::new(),
        };
        envelope.checksum = envelope.compute_checksum()?.to_hex().to_string();
        Ok(envelope)
    }

    /// Parses and verifies a backup without touching key material.
    pub fn parse(blob: &str) -> Result<Self, VaultError> {
        let envelope: Self = serde_json::from_str(blob)
            .map_err(|e| VaultError::Integrity(format!("backup is not a valid envelope: {}", e)))?;

        if envelope.format != BACKUP_FORMAT {
            return Err(VaultError::Integrity(format!(
                "unexpected backup format '{}'",
                envelope.format
            )));
        }
        if envelope.version != BACKUP_VERSION {
            return Err(VaultError::Integrity(format!(
                "unsupported backup version {}",
                envelope.version
            )));
        }

        let expected = blake3::Hash::from_hex(envelope.checksum.as_bytes())
            .map_err(|_| VaultError::Integrity("checksum is malformed".into()))?;
        // blake3::Hash equality is constant time.
        if envelope.compute_checksum()? != expected {
            return Err(VaultError::Integrity("checksum mismatch".into()));
        }

        if decode_b64("nonce", &envelope.nonce)?.len() != NONCE_LEN {
            return Err(VaultError::Integrity("nonce has the wrong length".into()));
        }
        if decode_b64("salt", &envelope.salt)?.len() < MIN_SALT_LEN {
            return Err(VaultError::Integrity("salt is too short".into()));
        }
        envelope.kdf.validate().map_err(|e| VaultError::Integrity(e.to_string()))?;

        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String, VaultError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn sealed_blob(&self) -> SealedBlob {
        SealedBlob {
            nonce: self.nonce.clone(),
            ciphertext: self.ciphertext.clone(),
        }
    }

    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            version: self.version,
            created_at: self.created_at.clone(),
            record_counts: self.record_counts.clone(),
            total_records: self.record_counts.values().sum(),
        }
    }

    fn compute_checksum(&self) -> Result<blake3::Hash, VaultError> {
        let fields = ChecksumFields {
            format: &self.format,
            version: self.version,
            created_at: &self.created_at,
            record_counts: &self.record_counts,
            kdf: &self.kdf,
            salt: &self.salt,
            nonce: &self.nonce,
            ciphertext: &self.ciphertext,
        };
        let bytes = serde_json::to_vec(&fields)?;
        Ok(blake3::hash(&bytes))
    }
}
