// hds-local-store/src/lib.rs

pub mod clock;
pub mod compartment;
pub mod config;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod remote;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod vault;

// Public API exports
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use compartment::{
    ChannelNotifier, CleanupNotice, CleanupOutcome, CleanupReason, CompartmentConfig,
    CompartmentState, CompartmentStats, CompartmentStore, StoredRecord,
};
pub use config::Config;
pub use error::{CompartmentError, ErrorKind, SessionError, VaultError};
pub use persistence::{InMemoryKeyValueStore, KeyValueStore, LocalDatabase};
pub use remote::{InMemorySessionStore, RemoteSessionStore, SqliteSessionStore};
pub use service::{LocalDataService, ServiceComponents};
pub use session::{SessionConfig, SessionManager, SessionStats};
pub use vault::{ImportMode, ImportReport, PasswordPolicy, SecureVault, VaultState};
