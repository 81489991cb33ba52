// hds-local-store/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

use crate::vault::KdfParams;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub compartment_ttl_minutes: u32,
    pub session_expiry_minutes: u32,
    pub sweep_interval_minutes: u32,
    pub auto_cleanup: bool,
    pub scrub_prefixes: Vec<String>,
    pub remote_sync_retries: u32,
    pub password_min_length: usize,
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
    pub kdf_parallelism: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/hds_local.db"),
            compartment_ttl_minutes: 30,
            session_expiry_minutes: 30,
            sweep_interval_minutes: 10,
            auto_cleanup: true,
            scrub_prefixes: vec!["temp_".to_string(), "demo_".to_string()],
            remote_sync_retries: 3,
            password_min_length: 8,
            kdf_memory_kib: 19_456,
            kdf_iterations: 2,
            kdf_parallelism: 1,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();
        let scrub_prefixes = match env::var("HDS_SCRUB_PREFIXES") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => defaults.scrub_prefixes.clone(),
        };

        let config = Self {
            db_path: env::var("HDS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            compartment_ttl_minutes: parse_var(
                "HDS_COMPARTMENT_TTL_MINUTES",
                defaults.compartment_ttl_minutes,
            )?,
            session_expiry_minutes: parse_var(
                "HDS_SESSION_EXPIRY_MINUTES",
                defaults.session_expiry_minutes,
            )?,
            sweep_interval_minutes: parse_var(
                "HDS_SWEEP_INTERVAL_MINUTES",
                defaults.sweep_interval_minutes,
            )?,
            auto_cleanup: parse_var("HDS_AUTO_CLEANUP", defaults.auto_cleanup)?,
            scrub_prefixes,
            remote_sync_retries: parse_var("HDS_REMOTE_SYNC_RETRIES", defaults.remote_sync_retries)?,
            password_min_length: parse_var("HDS_PASSWORD_MIN_LENGTH", defaults.password_min_length)?,
            kdf_memory_kib: parse_var("HDS_KDF_MEMORY_KIB", defaults.kdf_memory_kib)?,
            kdf_iterations: parse_var("HDS_KDF_ITERATIONS", defaults.kdf_iterations)?,
            kdf_parallelism: parse_var("HDS_KDF_PARALLELISM", defaults.kdf_parallelism)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compartment_ttl_minutes == 0 {
            anyhow::bail!("HDS_COMPARTMENT_TTL_MINUTES must be greater than 0");
        }
        if self.session_expiry_minutes == 0 {
            anyhow::bail!("HDS_SESSION_EXPIRY_MINUTES must be greater than 0");
        }
        if self.sweep_interval_minutes == 0 {
            anyhow::bail!("HDS_SWEEP_INTERVAL_MINUTES must be greater than 0");
        }
        if self.password_min_length < 8 {
            anyhow::bail!("HDS_PASSWORD_MIN_LENGTH must be at least 8");
        }
        self.kdf_params()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid KDF parameters: {}", e))?;
        Ok(())
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.kdf_memory_kib,
            iterations: self.kdf_iterations,
            parallelism: self.kdf_parallelism,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database Path: {}", self.db_path.display());
        info!("- Compartment TTL: {} min", self.compartment_ttl_minutes);
        info!("- Session Expiry: {} min", self.session_expiry_minutes);
        info!("- Sweep Interval: {} min", self.sweep_interval_minutes);
        info!("- Auto Cleanup: {}", self.auto_cleanup);
        info!("- Scrub Prefixes: {:?}", self.scrub_prefixes);
        info!("- Remote Sync Retries: {}", self.remote_sync_retries);
        info!("- Password Min Length: {}", self.password_min_length);
        info!(
            "- KDF: Argon2id m={} KiB t={} p={}",
            self.kdf_memory_kib, self.kdf_iterations, self.kdf_parallelism
        );
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}
