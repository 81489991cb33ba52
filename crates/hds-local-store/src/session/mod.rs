//! Session layer on top of the compartment store.

pub mod session_config;
pub mod session_manager;

pub use session_config::{ManagerSettings, SessionConfig};
pub use session_manager::{
    marker_key, CleanupCycleReport, SessionInfo, SessionManager, SessionStats,
    SESSION_MARKER_PREFIX,
};
