use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CompartmentError;

pub const DEFAULT_CLEANUP_INTERVAL_MINUTES: u32 = 30;

/// Parameters for a new compartment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompartmentConfig {
    pub user_id: String,
    pub session_id: String,
    /// Defaults to the store clock's current time.
    pub created_at: Option<DateTime<Utc>>,
    pub auto_cleanup: bool,
    /// Defaults to the store's [`StoreSettings::default_interval_minutes`].
    pub cleanup_interval_minutes: Option<u32>,
}

impl CompartmentConfig {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            created_at: None,
            auto_cleanup: true,
            cleanup_interval_minutes: None,
        }
    }

    pub fn with_interval(mut self, minutes: u32) -> Self {
        self.cleanup_interval_minutes = Some(minutes);
        self
    }

    pub fn with_auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn interval_minutes(&self, default_minutes: u32) -> u32 {
        self.cleanup_interval_minutes.unwrap_or(default_minutes)
    }

    pub fn validate(&self) -> Result<(), CompartmentError> {
        if self.user_id.trim().is_empty() {
            return Err(CompartmentError::InvalidConfig("user id is empty".into()));
        }
        if self.session_id.trim().is_empty() {
            return Err(CompartmentError::InvalidConfig("session id is empty".into()));
        }
        if self.cleanup_interval_minutes == Some(0) {
            return Err(CompartmentError::InvalidConfig(
                "cleanup interval must be at least one minute".into(),
            ));
        }
        Ok(())
    }
}

/// Store-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Persisted keys starting with one of these and containing the owning
    /// session id are scrubbed together with the compartment.
    pub scrub_prefixes: Vec<String>,
    /// Interval for compartments created without one.
    pub default_interval_minutes: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            scrub_prefixes: vec!["temp_".to_string(), "demo_".to_string()],
            default_interval_minutes: DEFAULT_CLEANUP_INTERVAL_MINUTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_defaults_to_thirty_minutes() {
        let config = CompartmentConfig::new("u1", "s1");
        assert_eq!(config.interval_minutes(DEFAULT_CLEANUP_INTERVAL_MINUTES), 30);
        assert_eq!(config.clone().with_interval(5).interval_minutes(30), 5);
        assert!(config.auto_cleanup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(CompartmentConfig::new("", "s1").validate().is_err());
        assert!(CompartmentConfig::new("u1", " ").validate().is_err());
        assert!(CompartmentConfig::new("u1", "s1")
            .with_interval(0)
            .validate()
            .is_err());
    }
}
