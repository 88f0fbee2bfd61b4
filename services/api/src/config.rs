//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Remote document store. `None` runs against an in-memory remote.
    pub database_url: Option<String>,
    pub cache_dir: PathBuf,
    pub log_level: Level,
    pub max_resubmission_attempts: u32,
    pub tracking_poll_interval: Duration,
    pub sync_retry_base: Duration,
    pub sync_retry_max: Duration,
    pub university_email_domain: Option<String>,
    pub reviewer_token: Option<String>,
    pub cors_origin: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // --- Server and Storage Settings ---
        let bind_address = parse_or(&var, "BIND_ADDRESS", "0.0.0.0:3000".parse().ok())?;
        let database_url = var("DATABASE_URL");
        let cache_dir = var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./.classroom-cache"));

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Review Workflow Settings ---
        let max_resubmission_attempts: u32 = parse_or(&var, "MAX_RESUBMISSION_ATTEMPTS", Some(5))?;
        if max_resubmission_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_RESUBMISSION_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let tracking_poll_secs: u64 = parse_or(&var, "TRACKING_POLL_SECS", Some(5))?;
        let university_email_domain = var("UNIVERSITY_EMAIL_DOMAIN");
        let reviewer_token = var("REVIEWER_TOKEN");

        // --- Mirror Settings ---
        let sync_retry_base_ms: u64 = parse_or(&var, "SYNC_RETRY_BASE_MS", Some(500))?;
        let sync_retry_max_ms: u64 = parse_or(&var, "SYNC_RETRY_MAX_MS", Some(30_000))?;
        if sync_retry_max_ms < sync_retry_base_ms {
            return Err(ConfigError::InvalidValue(
                "SYNC_RETRY_MAX_MS".to_string(),
                "must not be smaller than SYNC_RETRY_BASE_MS".to_string(),
            ));
        }

        let cors_origin = var("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        Ok(Self {
            bind_address,
            database_url,
            cache_dir,
            log_level,
            max_resubmission_attempts,
            tracking_poll_interval: Duration::from_secs(tracking_poll_secs.max(1)),
            sync_retry_base: Duration::from_millis(sync_retry_base_ms),
            sync_retry_max: Duration::from_millis(sync_retry_max_ms),
            university_email_domain,
            reviewer_token,
            cors_origin,
        })
    }
}

/// Parses `key` when present, otherwise falls back to `default`. A missing
/// key with no default is a `MissingVar` error.
fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Option<T>,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => default.ok_or_else(|| ConfigError::MissingVar(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_address, ([0, 0, 0, 0], 3000).into());
        assert!(config.database_url.is_none());
        assert_eq!(config.max_resubmission_attempts, 5);
        assert_eq!(config.tracking_poll_interval, Duration::from_secs(5));
        assert_eq!(config.sync_retry_base, Duration::from_millis(500));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/classroom"),
            ("MAX_RESUBMISSION_ATTEMPTS", "3"),
            ("TRACKING_POLL_SECS", "10"),
            ("UNIVERSITY_EMAIL_DOMAIN", "school.edu.ph"),
            ("RUST_LOG", "debug"),
        ])
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/classroom"));
        assert_eq!(config.max_resubmission_attempts, 3);
        assert_eq!(config.tracking_poll_interval, Duration::from_secs(10));
        assert_eq!(config.university_email_domain.as_deref(), Some("school.edu.ph"));
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("BIND_ADDRESS", "nowhere")]),
            Err(ConfigError::InvalidValue(key, _)) if key == "BIND_ADDRESS"
        ));
        assert!(config_from(&[("MAX_RESUBMISSION_ATTEMPTS", "0")]).is_err());
        assert!(config_from(&[("SYNC_RETRY_BASE_MS", "900"), ("SYNC_RETRY_MAX_MS", "100")]).is_err());
        assert!(config_from(&[("RUST_LOG", "chatty")]).is_err());
    }
}
