//! Password-gated encrypted entity store.
//!
//! Lifecycle: `Unconfigured -> Configuring -> Ready <-> Locked`, and `reset`
//! returns to `Unconfigured` from anywhere. The derived key lives only in
//! memory while `Ready`. There is no recovery path without the password
//! other than restoring a backup.
//!
//! Persisted layout in the key-value store:
//! - `vault::meta`: KDF parameters, salt, password verifier, entity types
//! - `vault::entity::<type>`: sealed JSON array of records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::clock::{Clock, SharedClock};
use crate::error::VaultError;
use crate::metrics;
use crate::persistence::{format_timestamp, KeyValueStore};
use crate::vault::backup::{BackupEnvelope, BackupPayload, BackupSummary, BACKUP_AAD};
use crate::vault::crypto::{
    decode_b64, derive_key_async, encode_b64, generate_salt, open, seal, DerivedKey, KdfParams,
    SealedBlob,
};
use crate::vault::password_policy::PasswordPolicy;

pub const META_KEY: &str = "vault::meta";
pub const ENTITY_KEY_PREFIX: &str = "vault::entity::";
const VAULT_KEY_PREFIX: &str = "vault::";
const VERIFIER_PLAINTEXT: &[u8] = b"hds-local-vault-verifier";
const META_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VaultState {
    Unconfigured,
    Configuring,
    Ready,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportMode {
    /// Clear every collection, then load the backup.
    Replace,
    /// Upsert by id; the incoming record wins.
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRecordError {
    pub entity_type: String,
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: BTreeMap<String, usize>,
    pub errors: Vec<ImportRecordError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultMeta {
    version: u32,
    kdf: KdfParams,
    salt: String,
    verifier: SealedBlob,
    entities: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl VaultMeta {
    fn ensure_entity(&self, entity_type: &str) -> Result<(), VaultError> {
        if self.entities.iter().any(|e| e == entity_type) {
            Ok(())
        } else {
            Err(VaultError::UnknownEntity(entity_type.to_string()))
        }
    }
}

struct VaultInner {
    state: VaultState,
    key: Option<DerivedKey>,
    meta: Option<VaultMeta>,
}

impl VaultInner {
    fn ready(&self) -> Result<(&DerivedKey, &VaultMeta), VaultError> {
        match (self.state, &self.key, &self.meta) {
            (VaultState::Ready, Some(key), Some(meta)) => Ok((key, meta)),
            (VaultState::Ready, _, _) | (VaultState::Locked, _, _) => Err(VaultError::Locked),
            _ => Err(VaultError::NotConfigured),
        }
    }
}

pub struct SecureVault {
    kv: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    policy: PasswordPolicy,
    kdf: KdfParams,
    inner: Mutex<VaultInner>,
}

impl SecureVault {
    /// Opens the vault persisted in `kv`: `Locked` if one exists, otherwise
    /// `Unconfigured`.
    pub fn open(
        kv: Arc<dyn KeyValueStore>,
        clock: SharedClock,
        policy: PasswordPolicy,
        kdf: KdfParams,
    ) -> Result<Self, VaultError> {
        kdf.validate()?;
        let meta = match kv.get(META_KEY)? {
            Some(raw) => Some(
                serde_json::from_str::<VaultMeta>(&raw)
                    .map_err(|e| VaultError::Integrity(format!("vault metadata is corrupted: {}", e)))?,
            ),
            None => None,
        };
        let state = if meta.is_some() {
            VaultState::Locked
        } else {
            VaultState::Unconfigured
        };
        info!("Vault opened in state {:?}", state);

        Ok(Self {
            kv,
            clock,
            policy,
            kdf,
            inner: Mutex::new(VaultInner {
                state,
                key: None,
                meta,
            }),
        })
    }

    pub fn state(&self) -> VaultState {
        self.lock_inner().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == VaultState::Ready
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    /// Derives the key and creates empty collections for `entities`.
    pub async fn configure<S: AsRef<str>>(&self, password: &str, entities: &[S]) -> Result<(), VaultError> {
        observe("configure", self.configure_inner(password, entities).await)
    }

    async fn configure_inner<S: AsRef<str>>(&self, password: &str, entities: &[S]) -> Result<(), VaultError> {
        self.policy.check(password)?;
        let entities = normalize_entities(entities)?;

        {
            let mut inner = self.lock_inner();
            if inner.state != VaultState::Unconfigured {
                return Err(VaultError::AlreadyConfigured);
            }
            inner.state = VaultState::Configuring;
        }
        info!("Configuring vault with {} entity types", entities.len());

        let result = self.initialize(password, entities).await;

        let mut inner = self.lock_inner();
        match result {
            Ok(_) if inner.state != VaultState::Configuring => {
                // Reset while deriving.
                drop(inner);
                self.wipe()?;
                Err(VaultError::NotConfigured)
            }
            Ok((key, meta)) => {
                inner.state = VaultState::Ready;
                inner.key = Some(key);
                inner.meta = Some(meta);
                info!("Vault configured and ready");
                Ok(())
            }
            Err(e) => {
                inner.state = VaultState::Unconfigured;
                Err(e)
            }
        }
    }

    async fn initialize(
        &self,
        password: &str,
        entities: Vec<String>,
    ) -> Result<(DerivedKey, VaultMeta), VaultError> {
        let salt = generate_salt();
        let key = derive_key_async(password, salt.to_vec(), self.kdf).await?;
        let now = self.clock.now();
        let meta = VaultMeta {
            version: META_VERSION,
            kdf: self.kdf,
            salt: encode_b64(&salt),
            verifier: seal(&key, VERIFIER_PLAINTEXT, META_KEY.as_bytes())?,
            entities,
            created_at: now,
            updated_at: now,
        };
        for entity in &meta.entities {
            self.save_collection(&key, entity, &[])?;
        }
        self.save_meta(&meta)?;
        Ok((key, meta))
    }

    /// A wrong password leaves the vault locked.
    pub async fn unlock(&self, password: &str) -> Result<(), VaultError> {
        observe("unlock", self.unlock_inner(password).await)
    }

    async fn unlock_inner(&self, password: &str) -> Result<(), VaultError> {
        let meta = {
            let inner = self.lock_inner();
            match (inner.state, &inner.meta) {
                (VaultState::Ready, _) => return Ok(()),
                (VaultState::Locked, Some(meta)) => meta.clone(),
                _ => return Err(VaultError::NotConfigured),
            }
        };

        let key = self.verify_password(&meta, password).await?;

        let mut inner = self.lock_inner();
        if inner.state == VaultState::Locked {
            inner.state = VaultState::Ready;
            inner.key = Some(key);
            info!("Vault unlocked");
        }
        Ok(())
    }

    /// Drops the in-memory key.
    pub fn lock(&self) {
        let mut inner = self.lock_inner();
        if inner.state == VaultState::Ready {
            inner.state = VaultState::Locked;
            inner.key = None;
            info!("Vault locked");
        }
    }

    /// Declared entity types. Available while locked.
    pub fn entity_types(&self) -> Result<Vec<String>, VaultError> {
        self.lock_inner()
            .meta
            .as_ref()
            .map(|m| m.entities.clone())
            .ok_or(VaultError::NotConfigured)
    }

    /// Inserts or replaces the record with the same id.
    pub fn write(&self, entity_type: &str, record: Value) -> Result<(), VaultError> {
        observe("write", self.write_inner(entity_type, record))
    }

    fn write_inner(&self, entity_type: &str, record: Value) -> Result<(), VaultError> {
        let inner = self.lock_inner();
        let (key, meta) = inner.ready()?;
        meta.ensure_entity(entity_type)?;
        let id = record_id(&record).map_err(VaultError::InvalidRecord)?;

        let mut collection = self.load_collection(key, entity_type)?;
        upsert(&mut collection, &id, record);
        self.save_collection(key, entity_type, &collection)?;
        debug!("Vault wrote {} record {}", entity_type, id);
        Ok(())
    }

    pub fn read(&self, entity_type: &str, id: &str) -> Result<Option<Value>, VaultError> {
        let inner = self.lock_inner();
        let (key, meta) = inner.ready()?;
        meta.ensure_entity(entity_type)?;
        Ok(self
            .load_collection(key, entity_type)?
            .into_iter()
            .find(|r| record_id(r).map_or(false, |rid| rid == id)))
    }

    pub fn list(&self, entity_type: &str) -> Result<Vec<Value>, VaultError> {
        let inner = self.lock_inner();
        let (key, meta) = inner.ready()?;
        meta.ensure_entity(entity_type)?;
        self.load_collection(key, entity_type)
    }

    /// Returns false when no record had that id.
    pub fn delete(&self, entity_type: &str, id: &str) -> Result<bool, VaultError> {
        observe("delete", self.delete_inner(entity_type, id))
    }

    fn delete_inner(&self, entity_type: &str, id: &str) -> Result<bool, VaultError> {
        let inner = self.lock_inner();
        let (key, meta) = inner.ready()?;
        meta.ensure_entity(entity_type)?;

        let mut collection = self.load_collection(key, entity_type)?;
        let before = collection.len();
        collection.retain(|r| record_id(r).map_or(true, |rid| rid != id));
        if collection.len() == before {
            return Ok(false);
        }
        self.save_collection(key, entity_type, &collection)?;
        Ok(true)
    }

    /// Re-encrypts every collection under a key derived from `new_password`
    /// and a fresh salt.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), VaultError> {
        observe(
            "change_password",
            self.change_password_inner(old_password, new_password).await,
        )
    }

    async fn change_password_inner(&self, old_password: &str, new_password: &str) -> Result<(), VaultError> {
        self.policy.check(new_password)?;
        let snapshot = self.lock_inner().ready()?.1.clone();
        self.verify_password(&snapshot, old_password).await?;

        let salt = generate_salt();
        let new_key = derive_key_async(new_password, salt.to_vec(), self.kdf).await?;

        let mut inner = self.lock_inner();
        let (old_key, meta) = inner.ready()?;
        if meta.salt != snapshot.salt {
            return Err(VaultError::Authentication);
        }

        // Seal everything before the first write.
        let mut sealed = Vec::with_capacity(meta.entities.len());
        for entity in &meta.entities {
            let collection = self.load_collection(old_key, entity)?;
            sealed.push((entity.clone(), seal_collection(&new_key, entity, &collection)?));
        }
        let mut new_meta = meta.clone();
        new_meta.kdf = self.kdf;
        new_meta.salt = encode_b64(&salt);
        new_meta.verifier = seal(&new_key, VERIFIER_PLAINTEXT, META_KEY.as_bytes())?;
        new_meta.updated_at = self.clock.now();

        for (entity, blob) in &sealed {
            self.kv
                .set(&entity_key(entity), &serde_json::to_string(blob)?)?;
        }
        self.save_meta(&new_meta)?;

        inner.key = Some(new_key);
        inner.meta = Some(new_meta);
        info!("Vault password changed");
        Ok(())
    }

    /// Exports every collection sealed under the current password.
    pub async fn export_backup(&self, password: &str) -> Result<String, VaultError> {
        observe("export_backup", self.export_backup_inner(password).await)
    }

    async fn export_backup_inner(&self, password: &str) -> Result<String, VaultError> {
        let snapshot = self.lock_inner().ready()?.1.clone();
        let key = self.verify_password(&snapshot, password).await?;

        let payload = {
            let inner = self.lock_inner();
            let (_, meta) = inner.ready()?;
            if meta.salt != snapshot.salt {
                return Err(VaultError::Authentication);
            }
            let mut payload = BackupPayload::default();
            for entity in &meta.entities {
                payload
                    .entities
                    .insert(entity.clone(), self.load_collection(&key, entity)?);
            }
            payload
        };

        let record_counts: BTreeMap<String, usize> = payload
            .entities
            .iter()
            .map(|(entity, records)| (entity.clone(), records.len()))
            .collect();
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        let sealed = seal(&key, &plaintext, BACKUP_AAD)?;

        let envelope = BackupEnvelope::seal(
            format_timestamp(self.clock.now()),
            record_counts,
            snapshot.kdf,
            snapshot.salt.clone(),
            sealed,
        )?;
        let total: usize = envelope.record_counts.values().sum();
        info!("Vault backup exported ({} records)", total);
        envelope.to_json()
    }

    /// Checks integrity, then whether `password` opens the backup. Never
    /// mutates vault state.
    pub async fn verify_backup_password(&self, blob: &str, password: &str) -> Result<bool, VaultError> {
        observe("verify_backup", self.verify_backup_inner(blob, password).await)
    }

    async fn verify_backup_inner(&self, blob: &str, password: &str) -> Result<bool, VaultError> {
        let envelope = BackupEnvelope::parse(blob)?;
        let salt = decode_b64("salt", &envelope.salt)?;
        let key = derive_key_async(password, salt, envelope.kdf).await?;
        match open(&key, &envelope.sealed_blob(), BACKUP_AAD) {
            Ok(_) => Ok(true),
            Err(VaultError::Authentication) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Integrity checks only; no key derivation.
    pub fn inspect_backup(&self, blob: &str) -> Result<BackupSummary, VaultError> {
        Ok(BackupEnvelope::parse(blob)?.summary())
    }

    /// Restores a backup. Records without a usable id are reported in
    /// [`ImportReport::errors`] and skipped.
    pub async fn import_all_secure(
        &self,
        blob: &str,
        password: &str,
        mode: ImportMode,
    ) -> Result<ImportReport, VaultError> {
        observe("import", self.import_inner(blob, password, mode).await)
    }

    async fn import_inner(&self, blob: &str, password: &str, mode: ImportMode) -> Result<ImportReport, VaultError> {
        let envelope = BackupEnvelope::parse(blob)?;
        self.lock_inner().ready()?;

        let salt = decode_b64("salt", &envelope.salt)?;
        let backup_key = derive_key_async(password, salt, envelope.kdf).await?;
        let plaintext = open(&backup_key, &envelope.sealed_blob(), BACKUP_AAD)?;
        let payload: BackupPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::Integrity(format!("backup payload is malformed: {}", e)))?;

        let mut inner = self.lock_inner();
        let (key, meta) = inner.ready()?;
        let key = key.clone();
        let mut meta = meta.clone();

        let mut collections: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for entity in &meta.entities {
            let existing = match mode {
                ImportMode::Replace => Vec::new(),
                ImportMode::Merge => self.load_collection(&key, entity)?,
            };
            collections.insert(entity.clone(), existing);
        }

        let mut report = ImportReport::default();
        for (entity, records) in payload.entities {
            if entity.trim().is_empty() {
                report.errors.push(ImportRecordError {
                    entity_type: entity,
                    index: 0,
                    message: "entity type name is empty".into(),
                });
                continue;
            }
            if !meta.entities.contains(&entity) {
                info!("Import adds entity type {}", entity);
                meta.entities.push(entity.clone());
            }

            let collection = collections.entry(entity.clone()).or_default();
            let mut imported = 0;
            for (index, record) in records.into_iter().enumerate() {
                match record_id(&record) {
                    Ok(id) => {
                        upsert(collection, &id, record);
                        imported += 1;
                    }
                    Err(message) => report.errors.push(ImportRecordError {
                        entity_type: entity.clone(),
                        index,
                        message,
                    }),
                }
            }
            report.imported.insert(entity, imported);
        }

        for (entity, collection) in &collections {
            self.save_collection(&key, entity, collection)?;
        }
        meta.updated_at = self.clock.now();
        self.save_meta(&meta)?;
        inner.meta = Some(meta);

        if !report.errors.is_empty() {
            warn!("Vault import skipped {} invalid records", report.errors.len());
        }
        info!(
            "Vault import ({:?}) restored {} records",
            mode,
            report.imported.values().sum::<usize>()
        );
        Ok(report)
    }

    /// Irreversibly destroys every vault key and returns to `Unconfigured`.
    /// Callers are expected to have confirmed with the user.
    pub fn reset(&self) -> Result<(), VaultError> {
        observe("reset", self.wipe())
    }

    fn wipe(&self) -> Result<(), VaultError> {
        let mut inner = self.lock_inner();
        let removed = self
            .kv
            .remove_matching(&|key: &str| key.starts_with(VAULT_KEY_PREFIX))?;
        inner.state = VaultState::Unconfigured;
        inner.key = None;
        inner.meta = None;
        warn!("Vault reset: {} persisted entries destroyed", removed.len());
        Ok(())
    }

    async fn verify_password(&self, meta: &VaultMeta, password: &str) -> Result<DerivedKey, VaultError> {
        let salt = decode_b64("salt", &meta.salt)?;
        let key = derive_key_async(password, salt, meta.kdf).await?;
        let plaintext = open(&key, &meta.verifier, META_KEY.as_bytes())?;
        if plaintext.as_slice() != VERIFIER_PLAINTEXT {
            return Err(VaultError::Authentication);
        }
        Ok(key)
    }

    fn lock_inner(&self) -> MutexGuard<'_, VaultInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn save_meta(&self, meta: &VaultMeta) -> Result<(), VaultError> {
        self.kv.set(META_KEY, &serde_json::to_string(meta)?)?;
        Ok(())
    }

    fn load_collection(&self, key: &DerivedKey, entity_type: &str) -> Result<Vec<Value>, VaultError> {
        let storage_key = entity_key(entity_type);
        let Some(raw) = self.kv.get(&storage_key)? else {
            return Ok(Vec::new());
        };
        let blob: SealedBlob = serde_json::from_str(&raw)
            .map_err(|e| VaultError::Integrity(format!("{} is corrupted: {}", storage_key, e)))?;
        let plaintext = open(key, &blob, storage_key.as_bytes()).map_err(|e| match e {
            VaultError::Authentication => {
                VaultError::Integrity(format!("{} failed authentication", storage_key))
            }
            other => other,
        })?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::Integrity(format!("{} is corrupted: {}", storage_key, e)))
    }

    fn save_collection(&self, key: &DerivedKey, entity_type: &str, records: &[Value]) -> Result<(), VaultError> {
        let blob = seal_collection(key, entity_type, records)?;
        self.kv
            .set(&entity_key(entity_type), &serde_json::to_string(&blob)?)?;
        Ok(())
    }
}

fn entity_key(entity_type: &str) -> String {
    format!("{}{}", ENTITY_KEY_PREFIX, entity_type)
}

fn seal_collection(key: &DerivedKey, entity_type: &str, records: &[Value]) -> Result<SealedBlob, VaultError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(records)?);
    seal(key, &plaintext, entity_key(entity_type).as_bytes())
}

fn normalize_entities<S: AsRef<str>>(entities: &[S]) -> Result<Vec<String>, VaultError> {
    let mut normalized: Vec<String> = Vec::new();
    for entity in entities {
        let name = entity.as_ref().trim();
        if name.is_empty() {
            return Err(VaultError::Validation("entity type name is empty".into()));
        }
        if !normalized.iter().any(|n| n == name) {
            normalized.push(name.to_string());
        }
    }
    if normalized.is_empty() {
        return Err(VaultError::Validation(
            "at least one entity type must be declared".into(),
        ));
    }
    Ok(normalized)
}

/// String or integer `id` of a JSON object, as a string.
fn record_id(record: &Value) -> Result<String, String> {
    let object = record
        .as_object()
        .ok_or_else(|| "record is not a JSON object".to_string())?;
    match object.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(_) => Err("record id must be a non-empty string or an integer".to_string()),
        None => Err("record has no id".to_string()),
    }
}

/// Replaces in place when the id exists, otherwise appends.
fn upsert(collection: &mut Vec<Value>, id: &str, record: Value) {
    match collection
        .iter_mut()
        .find(|r| record_id(r).map_or(false, |rid| rid == id))
    {
        Some(existing) => *existing = record,
        None => collection.push(record),
    }
}

fn observe<T>(operation: &str, result: Result<T, VaultError>) -> Result<T, VaultError> {
    match &result {
        Ok(_) => metrics::inc_vault_operation(operation, "ok"),
        Err(e) => {
            warn!("Vault {} failed ({:?}): {}", operation, e.kind(), e);
            metrics::inc_vault_operation(operation, "error");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::persistence::InMemoryKeyValueStore;
    use crate::vault::crypto::test_params;
    use serde_json::json;

    const PASSWORD: &str = "Strong1!2";

    fn vault_on(kv: &InMemoryKeyValueStore) -> SecureVault {
        SecureVault::open(
            Arc::new(kv.clone()),
            Arc::new(ManualClock::starting_now()),
            PasswordPolicy::default(),
            test_params(),
        )
        .unwrap()
    }

    async fn configured(entities: &[&str]) -> (SecureVault, InMemoryKeyValueStore) {
        let kv = InMemoryKeyValueStore::new();
        let vault = vault_on(&kv);
        vault.configure(PASSWORD, entities).await.unwrap();
        (vault, kv)
    }

    #[tokio::test]
    async fn test_weak_password_is_rejected_before_anything_else() {
        let kv = InMemoryKeyValueStore::new();
        let vault = vault_on(&kv);

        let err = vault.configure("Weak1!", &["patients"]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(vault.state(), VaultState::Unconfigured);
        assert!(kv.is_empty());

        vault.configure(PASSWORD, &["patients"]).await.unwrap();
        assert_eq!(vault.state(), VaultState::Ready);
    }

    #[tokio::test]
    async fn test_configure_twice_is_rejected() {
        let (vault, _) = configured(&["patients"]).await;
        assert!(matches!(
            vault.configure(PASSWORD, &["patients"]).await,
            Err(VaultError::AlreadyConfigured)
        ));
    }

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let (vault, kv) = configured(&["patients", "invoices"]).await;
        vault.write("patients", json!({"id": "p1", "name": "Alice"})).unwrap();
        vault.write("patients", json!({"id": 2, "name": "Bob"})).unwrap();
        vault.write("patients", json!({"id": "p1", "name": "Alice B."})).unwrap();

        let listed = vault.list("patients").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["name"], "Alice B.");
        assert_eq!(vault.read("patients", "2").unwrap().unwrap()["name"], "Bob");
        assert!(vault.read("patients", "missing").unwrap().is_none());

        let at_rest = kv.get("vault::entity::patients").unwrap().unwrap();
        assert!(!at_rest.contains("Alice"));

        assert!(vault.delete("patients", "p1").unwrap());
        assert!(!vault.delete("patients", "p1").unwrap());
        assert_eq!(vault.list("patients").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_records_and_unknown_entities() {
        let (vault, _) = configured(&["patients"]).await;
        assert!(matches!(
            vault.write("patients", json!({"name": "no id"})),
            Err(VaultError::InvalidRecord(_))
        ));
        assert!(matches!(
            vault.write("patients", json!([1, 2])),
            Err(VaultError::InvalidRecord(_))
        ));
        assert!(matches!(
            vault.write("appointments", json!({"id": 1})),
            Err(VaultError::UnknownEntity(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let (vault, _) = configured(&["patients"]).await;
        vault.write("patients", json!({"id": 1})).unwrap();
        vault.lock();

        assert!(matches!(vault.list("patients"), Err(VaultError::Locked)));
        let err = vault.unlock("Wrong1!pass").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(vault.state(), VaultState::Locked);

        vault.unlock(PASSWORD).await.unwrap();
        assert_eq!(vault.list("patients").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopened_vault_starts_locked() {
        let (vault, kv) = configured(&["patients"]).await;
        vault.write("patients", json!({"id": 1})).unwrap();
        drop(vault);

        let reopened = vault_on(&kv);
        assert_eq!(reopened.state(), VaultState::Locked);
        assert_eq!(reopened.entity_types().unwrap(), vec!["patients"]);
        reopened.unlock(PASSWORD).await.unwrap();
        assert_eq!(reopened.list("patients").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_export_then_replace_import_round_trips() {
        let (source, _) = configured(&["patients", "invoices"]).await;
        source.write("patients", json!({"id": 1, "name": "Alice"})).unwrap();
        source.write("patients", json!({"id": 2, "name": "Bob"})).unwrap();
        source.write("invoices", json!({"id": "inv-1", "amount": 60})).unwrap();
        let blob = source.export_backup(PASSWORD).await.unwrap();

        let kv = InMemoryKeyValueStore::new();
        let target = vault_on(&kv);
        target.configure("Other1!pass", &["patients"]).await.unwrap();
        target.write("patients", json!({"id": 9})).unwrap();

        let report = target
            .import_all_secure(&blob, PASSWORD, ImportMode::Replace)
            .await
            .unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(report.imported["patients"], 2);
        assert_eq!(target.list("patients").unwrap(), source.list("patients").unwrap());
        assert_eq!(target.list("invoices").unwrap(), source.list("invoices").unwrap());
        assert_eq!(target.entity_types().unwrap(), vec!["patients", "invoices"]);
    }

    #[tokio::test]
    async fn test_verify_backup_password() {
        let (vault, _) = configured(&["patients"]).await;
        vault.write("patients", json!({"id": 1})).unwrap();
        let blob = vault.export_backup(PASSWORD).await.unwrap();

        assert!(!vault.verify_backup_password(&blob, "wrongpw").await.unwrap());
        assert!(vault.verify_backup_password(&blob, PASSWORD).await.unwrap());
        assert_eq!(vault.state(), VaultState::Ready);
        assert_eq!(vault.inspect_backup(&blob).unwrap().total_records, 1);
    }

    #[tokio::test]
    async fn test_corrupted_backup_fails_integrity() {
        let (vault, _) = configured(&["patients"]).await;
        let blob = vault.export_backup(PASSWORD).await.unwrap();
        let corrupted = blob.replacen("\"version\": 1", "\"version\": 2", 1);

        let err = vault.verify_backup_password(&corrupted, PASSWORD).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        let err = vault
            .import_all_secure("{\"truncated\":", PASSWORD, ImportMode::Merge)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn test_backup_declaring_excessive_kdf_cost_is_refused() {
        let (vault, _) = configured(&["patients"]).await;
        let blob = vault.export_backup(PASSWORD).await.unwrap();
        let mut envelope = BackupEnvelope::parse(&blob).unwrap();
        let heavy = BackupEnvelope::seal(
            envelope.created_at.clone(),
            envelope.record_counts.clone(),
            KdfParams {
                memory_kib: 4 * 1024 * 1024,
                iterations: 10_000,
                parallelism: 1,
            },
            std::mem::take(&mut envelope.salt),
            envelope.sealed_blob(),
        )
        .unwrap()
        .to_json()
        .unwrap();

        let err = vault.verify_backup_password(&heavy, PASSWORD).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        let err = vault
            .import_all_secure(&heavy, PASSWORD, ImportMode::Merge)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn test_export_requires_current_password() {
        let (vault, _) = configured(&["patients"]).await;
        assert!(matches!(
            vault.export_backup("Wrong1!pass").await,
            Err(VaultError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_merge_is_last_write_wins() {
        let (source, _) = configured(&["patients"]).await;
        source.write("patients", json!({"id": 1, "name": "new"})).unwrap();
        source.write("patients", json!({"id": 2, "name": "other"})).unwrap();
        let blob = source.export_backup(PASSWORD).await.unwrap();

        let (target, _) = configured(&["patients"]).await;
        target.write("patients", json!({"id": 1, "name": "old"})).unwrap();
        target.write("patients", json!({"id": 3, "name": "local"})).unwrap();

        target
            .import_all_secure(&blob, PASSWORD, ImportMode::Merge)
            .await
            .unwrap();

        let patients = target.list("patients").unwrap();
        assert_eq!(patients.len(), 3);
        assert_eq!(patients[0], json!({"id": 1, "name": "new"}));
        assert_eq!(patients[1]["id"], 3);
    }

    #[tokio::test]
    async fn test_wrong_import_password_changes_nothing() {
        let (source, _) = configured(&["patients"]).await;
        source.write("patients", json!({"id": 1})).unwrap();
        let blob = source.export_backup(PASSWORD).await.unwrap();

        let (target, _) = configured(&["patients"]).await;
        target.write("patients", json!({"id": 7})).unwrap();
        let err = target
            .import_all_secure(&blob, "Wrong1!pass", ImportMode::Replace)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(target.list("patients").unwrap(), vec![json!({"id": 7})]);
    }

    #[tokio::test]
    async fn test_change_password() {
        let (vault, kv) = configured(&["patients"]).await;
        vault.write("patients", json!({"id": 1})).unwrap();

        assert!(vault.change_password("Wrong1!pass", "Newer1!pass").await.is_err());
        vault.change_password(PASSWORD, "Newer1!pass").await.unwrap();
        assert_eq!(vault.list("patients").unwrap().len(), 1);

        let reopened = vault_on(&kv);
        assert!(reopened.unlock(PASSWORD).await.is_err());
        reopened.unlock("Newer1!pass").await.unwrap();
        assert_eq!(reopened.list("patients").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_destroys_everything() {
        let (vault, kv) = configured(&["patients"]).await;
        vault.write("patients", json!({"id": 1})).unwrap();
        kv.set("theme", "dark").unwrap();

        vault.reset().unwrap();
        assert_eq!(vault.state(), VaultState::Unconfigured);
        assert_eq!(kv.keys().unwrap(), vec!["theme".to_string()]);
        assert!(matches!(vault.list("patients"), Err(VaultError::NotConfigured)));

        vault.configure(PASSWORD, &["patients"]).await.unwrap();
        assert!(vault.list("patients").unwrap().is_empty());
    }

    #[test]
    fn test_record_ids() {
        assert_eq!(record_id(&json!({"id": "a"})).unwrap(), "a");
        assert_eq!(record_id(&json!({"id": 42})).unwrap(), "42");
        assert!(record_id(&json!({"id": 1.5})).is_err());
        assert!(record_id(&json!({"id": ""})).is_err());
    }
}
