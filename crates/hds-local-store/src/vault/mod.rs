//! Secure local vault: password-derived encryption for sensitive entities.

pub mod backup;
pub mod crypto;
pub mod password_policy;
pub mod secure_vault;

pub use backup::{BackupEnvelope, BackupPayload, BackupSummary, BACKUP_FORMAT, BACKUP_VERSION};
pub use crypto::{DerivedKey, KdfParams, SealedBlob};
pub use password_policy::PasswordPolicy;
pub use secure_vault::{
    ImportMode, ImportRecordError, ImportReport, SecureVault, VaultState, ENTITY_KEY_PREFIX,
    META_KEY,
};
