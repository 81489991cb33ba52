use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Character-class password policy, checked before any key derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_symbol: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_symbol: true,
        }
    }
}

impl PasswordPolicy {
    pub fn with_min_length(min_length: usize) -> Self {
        Self {
            min_length,
            ..Default::default()
        }
    }

    /// Lists every unmet requirement. Never echoes the password.
    pub fn violations(&self, password: &str) -> Vec<String> {
        let mut violations = Vec::new();
        if password.chars().count() < self.min_length {
            violations.push(format!("must be at least {} characters", self.min_length));
        }
        if self.require_uppercase && !password.chars().any(char::is_uppercase) {
            violations.push("must contain an uppercase letter".to_string());
        }
        if self.require_lowercase && !password.chars().any(char::is_lowercase) {
            violations.push("must contain a lowercase letter".to_string());
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            violations.push("must contain a digit".to_string());
        }
        if self.require_symbol
            && !password
                .chars()
                .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
        {
            violations.push("must contain a symbol".to_string());
        }
        violations
    }

    pub fn check(&self, password: &str) -> Result<(), VaultError> {
        let violations = self.violations(password);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(VaultError::Validation(format!(
                "password {}",
                violations.join(", ")
            )))
        }
    }
}
