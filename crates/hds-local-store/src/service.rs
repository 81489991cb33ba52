//! Data-service facade consumed by UI adapters.
//!
//! Bundles the session manager and the vault behind one handle built from
//! [`Config`]. Every component is an owned instance; nothing is global.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::compartment::{CleanupNotifier, CompartmentStore, StoreSettings, StoredRecord, TracingNotifier};
use crate::config::Config;
use crate::error::{SessionError, VaultError};
use crate::persistence::{DatabaseStats, InMemoryKeyValueStore, KeyValueStore, LocalDatabase};
use crate::remote::{InMemorySessionStore, RemoteSessionStore, RetryPolicy, SqliteSessionStore};
use crate::session::{ManagerSettings, SessionConfig, SessionManager, SessionStats};
use crate::vault::{BackupSummary, ImportMode, ImportReport, PasswordPolicy, SecureVault, VaultState};

/// Collaborators a service is assembled from.
pub struct ServiceComponents {
    pub kv: Arc<dyn KeyValueStore>,
    pub remote: Arc<dyn RemoteSessionStore>,
    pub clock: SharedClock,
    pub notifier: Arc<dyn CleanupNotifier>,
}

pub struct LocalDataService {
    config: Arc<Config>,
    database: Option<Arc<LocalDatabase>>,
    sessions: SessionManager,
    vault: Arc<SecureVault>,
}

impl LocalDataService {
    /// Opens the SQLite database at `config.db_path`, falling back to an
    /// in-memory database if the file cannot be opened. Requires a tokio runtime.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let database = match LocalDatabase::new(&config.db_path) {
            Ok(db) => {
                info!("Local database initialized at: {}", config.db_path.display());
                Arc::new(db)
            }
            Err(e) => {
                warn!("Failed to open local database: {}. Falling back to in-memory.", e);
                Arc::new(LocalDatabase::new_in_memory()?)
            }
        };

        let clock = system_clock();
        let components = ServiceComponents {
            kv: database.key_values.clone(),
            remote: Arc::new(SqliteSessionStore::new(database.sessions.clone(), clock.clone())),
            clock,
            notifier: Arc::new(TracingNotifier),
        };
        let mut service = Self::with_components(config, components)?;
        service.database = Some(database);
        Ok(service)
    }

    /// Demo mode: nothing touches disk.
    pub fn in_memory(config: &Config, clock: SharedClock) -> anyhow::Result<Self> {
        let components = ServiceComponents {
            kv: Arc::new(InMemoryKeyValueStore::new()),
            remote: Arc::new(InMemorySessionStore::new(clock.clone())),
            clock,
            notifier: Arc::new(TracingNotifier),
        };
        Self::with_components(config, components)
    }

    pub fn with_components(config: &Config, components: ServiceComponents) -> anyhow::Result<Self> {
        config.validate()?;

        let store = CompartmentStore::with_settings(
            components.kv.clone(),
            components.clock.clone(),
            StoreSettings {
                scrub_prefixes: config.scrub_prefixes.clone(),
                default_interval_minutes: config.compartment_ttl_minutes,
            },
            components.notifier,
        );
        let sessions = SessionManager::new(
            store,
            components.remote,
            components.kv.clone(),
            ManagerSettings {
                default_expiry_minutes: config.session_expiry_minutes,
                sweep_interval_minutes: config.sweep_interval_minutes,
                auto_cleanup: config.auto_cleanup,
            },
            RetryPolicy {
                max_retries: config.remote_sync_retries,
                ..Default::default()
            },
        )?;
        let vault = SecureVault::open(
            components.kv,
            components.clock,
            PasswordPolicy::with_min_length(config.password_min_length),
            config.kdf_params(),
        )?;

        Ok(Self {
            config: Arc::new(config.clone()),
            database: None,
            sessions,
            vault: Arc::new(vault),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn vault(&self) -> &SecureVault {
        &self.vault
    }

    pub async fn create_session(&self, config: SessionConfig) -> Result<String, SessionError> {
        self.sessions.create_session(config).await
    }

    pub fn store_session_data(&self, session_id: &str, entity_type: &str, records: Vec<Value>) {
        self.sessions.store_session_data(session_id, entity_type, records)
    }

    pub fn get_session_data(&self, session_id: &str, entity_type: &str) -> Vec<StoredRecord> {
        self.sessions.get_session_data(session_id, entity_type)
    }

    pub fn cleanup_session(&self, session_id: &str) {
        self.sessions.cleanup_session(session_id);
    }

    pub fn get_session_stats(&self) -> SessionStats {
        self.sessions.get_session_stats()
    }

    pub async fn configure_vault<S: AsRef<str>>(&self, password: &str, entities: &[S]) -> Result<(), VaultError> {
        self.vault.configure(password, entities).await
    }

    pub fn vault_state(&self) -> VaultState {
        self.vault.state()
    }

    pub fn write(&self, entity_type: &str, record: Value) -> Result<(), VaultError> {
        self.vault.write(entity_type, record)
    }

    pub fn read(&self, entity_type: &str, id: &str) -> Result<Option<Value>, VaultError> {
        self.vault.read(entity_type, id)
    }

    pub async fn export_backup(&self, password: &str) -> Result<String, VaultError> {
        self.vault.export_backup(password).await
    }

    pub async fn verify_backup_password(&self, blob: &str, password: &str) -> Result<bool, VaultError> {
        self.vault.verify_backup_password(blob, password).await
    }

    pub fn inspect_backup(&self, blob: &str) -> Result<BackupSummary, VaultError> {
        self.vault.inspect_backup(blob)
    }

    pub async fn import_all_secure(
        &self,
        blob: &str,
        password: &str,
        mode: ImportMode,
    ) -> Result<ImportReport, VaultError> {
        self.vault.import_all_secure(blob, password, mode).await
    }

    /// Irreversible. The caller must have confirmed with the user.
    pub fn reset_vault(&self) -> Result<(), VaultError> {
        self.vault.reset()
    }

    pub fn start_automatic_cleanup(&self) -> bool {
        self.sessions.start_automatic_cleanup()
    }

    pub fn stop_automatic_cleanup(&self) -> bool {
        self.sessions.stop_automatic_cleanup()
    }

    /// `None` in demo mode.
    pub fn database_stats(&self) -> Option<anyhow::Result<DatabaseStats>> {
        self.database.as_ref().map(|db| db.get_stats())
    }

    /// Deletes durable session records cleaned more than `older_than_days` ago.
    pub fn purge_cleaned_sessions(&self, older_than_days: i64) -> anyhow::Result<usize> {
        match &self.database {
            Some(db) => db.purge_cleaned_sessions(older_than_days),
            None => Ok(0),
        }
    }

    /// Stops the sweep, drains queued remote calls and locks the vault.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.vault.lock();
        info!("Local data service shut down");
    }
}
