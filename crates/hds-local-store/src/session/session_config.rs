use serde::{Deserialize, Serialize};

use crate::error::SessionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub user_id: String,
    pub session_id: String,
    /// Entity types the session may hold.
    pub data_types: Vec<String>,
    /// Falls back to [`ManagerSettings::default_expiry_minutes`].
    pub expiry_minutes: Option<u32>,
}

impl SessionConfig {
    pub fn new<I, S>(user_id: impl Into<String>, session_id: impl Into<String>, data_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            data_types: data_types.into_iter().map(Into::into).collect(),
            expiry_minutes: None,
        }
    }

    pub fn with_expiry(mut self, minutes: u32) -> Self {
        self.expiry_minutes = Some(minutes);
        self
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.user_id.trim().is_empty() {
            return Err(SessionError::Validation("user id is empty".into()));
        }
        if self.session_id.trim().is_empty() {
            return Err(SessionError::Validation("session id is empty".into()));
        }
        if self.data_types.is_empty() {
            return Err(SessionError::Validation(
                "at least one entity type must be declared".into(),
            ));
        }
        if self.data_types.iter().any(|t| t.trim().is_empty()) {
            return Err(SessionError::Validation("entity type name is empty".into()));
        }
        if self.expiry_minutes == Some(0) {
            return Err(SessionError::Validation(
                "expiry must be at least one minute".into(),
            ));
        }
        Ok(())
    }
}

/// Manager-wide settings, usually derived from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub default_expiry_minutes: u32,
    pub sweep_interval_minutes: u32,
    pub auto_cleanup: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            default_expiry_minutes: 30,
            sweep_interval_minutes: 10,
            auto_cleanup: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(SessionConfig::new("u1", "s1", ["patients"]).validate().is_ok());
        assert!(SessionConfig::new("u1", "s1", Vec::<String>::new())
            .validate()
            .is_err());
        assert!(SessionConfig::new("u1", "", ["patients"]).validate().is_err());
        assert!(SessionConfig::new("u1", "s1", ["patients"])
            .with_expiry(0)
            .validate()
            .is_err());
    }
}
