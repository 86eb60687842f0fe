use std::time::Duration;

use crate::core::ServiceOptions;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://rssr.db?mode=rwc";

#[derive(Debug, thiserror::Error)]
#[error("{name} must be a positive integer, got {value:?}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub log_level: String,
    pub translate_interval_secs: u64,
    pub translate_batch: i64,
    pub translate_language: String,
}

impl AppConfig {
    /// | Env Var                        | Default                     |
    /// |--------------------------------|-----------------------------|
    /// | `RSSR_DATABASE_URL`            | `sqlite://rssr.db?mode=rwc` |
    /// | `RSSR_LOG`                     | `info`                      |
    /// | `RSSR_TRANSLATE_INTERVAL_SECS` | `900`                       |
    /// | `RSSR_TRANSLATE_BATCH`         | `10`                        |
    /// | `RSSR_TRANSLATE_LANGUAGE`      | `Chinese`                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &str, default: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let positive = |name: &'static str, default: &str| -> Result<u64, ConfigError> {
            let value = read(name, default);
            match value.parse::<u64>() {
                Ok(parsed) if parsed > 0 => Ok(parsed),
                _ => Err(ConfigError { name, value }),
            }
        };

        Ok(Self {
            database_url: read("RSSR_DATABASE_URL", DEFAULT_DATABASE_URL),
            log_level: read("RSSR_LOG", "info"),
            translate_interval_secs: positive("RSSR_TRANSLATE_INTERVAL_SECS", "900")?,
            translate_batch: positive("RSSR_TRANSLATE_BATCH", "10")?.min(i64::MAX as u64) as i64,
            translate_language: read("RSSR_TRANSLATE_LANGUAGE", "Chinese"),
        })
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            translate_interval: Duration::from_secs(self.translate_interval_secs),
            translate_batch: self.translate_batch,
            translate_language: self.translate_language.clone(),
            ..ServiceOptions::default()
        }
    }
}
