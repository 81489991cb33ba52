//! Session-scoped, self-expiring data partitions.

pub mod compartment_config;
pub mod compartment_store;
pub mod notifier;

pub use compartment_config::{CompartmentConfig, StoreSettings, DEFAULT_CLEANUP_INTERVAL_MINUTES};
pub use compartment_store::{
    CleanupOutcome, CompartmentInfo, CompartmentState, CompartmentStats, CompartmentStore,
    StoredRecord, SweepReport,
};
pub use notifier::{ChannelNotifier, CleanupNotice, CleanupNotifier, CleanupReason, TracingNotifier};
