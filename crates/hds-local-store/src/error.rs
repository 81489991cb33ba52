//! Error taxonomy for the caller-facing operations.
//!
//! Compartment and session lookups never fail: unknown or expired ids log and
//! resolve to empty results. Only session creation and vault operations
//! surface errors to the caller.

use thiserror::Error;

/// Coarse classification used by callers to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Integrity,
    State,
    Storage,
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Wrong password. No state was changed.
    #[error("authentication failed: wrong password or corrupted key material")]
    Authentication,

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("vault is not configured")]
    NotConfigured,

    #[error("vault is locked")]
    Locked,

    #[error("vault is already configured; reset it before configuring again")]
    AlreadyConfigured,

    #[error("entity type '{0}' is not managed by this vault")]
    UnknownEntity(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Validation(_)
            | VaultError::UnknownEntity(_)
            | VaultError::InvalidRecord(_) => ErrorKind::Validation,
            VaultError::Authentication => ErrorKind::Authentication,
            VaultError::Integrity(_) => ErrorKind::Integrity,
            VaultError::NotConfigured | VaultError::Locked | VaultError::AlreadyConfigured => {
                ErrorKind::State
            }
            VaultError::Storage(_) | VaultError::Crypto(_) => ErrorKind::Storage,
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Storage(anyhow::Error::new(e))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompartmentError {
    #[error("invalid compartment config: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid session config: {0}")]
    Validation(String),

    /// The durable session record could not be written; nothing was created locally.
    #[error("remote session store failed: {0}")]
    Remote(#[source] anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Validation(_) => ErrorKind::Validation,
            SessionError::Remote(_) => ErrorKind::Storage,
        }
    }
}
