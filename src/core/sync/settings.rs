use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{SettingsError, ValidationError};
use crate::core::storage::repository::{SourceRepository, StorageError};

pub const SYNC_SETTINGS_KEY: &str = "sync_settings";

const MIN_INTERVAL_SECS: i64 = 60;
const MAX_CONCURRENCY: i64 = 32;
const MAX_BATCH_LIMIT: i64 = 1000;
const MAX_TIMEOUT_SECS: i64 = 300;
const MAX_RETRY_COUNT: i64 = 5;

/// Scheduler knobs. Fields are signed so that out-of-range input can be
/// rejected with a field name instead of failing deserialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: i64,
    pub max_concurrency: i64,
    pub batch_limit: i64,
    pub timeout_secs: i64,
    pub retry_count: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            max_concurrency: 6,
            batch_limit: 200,
            timeout_secs: 20,
            retry_count: 2,
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fields = [
            ("interval_secs", self.interval_secs),
            ("max_concurrency", self.max_concurrency),
            ("batch_limit", self.batch_limit),
            ("timeout_secs", self.timeout_secs),
            ("retry_count", self.retry_count),
        ];
        for (field, value) in fields {
            if value <= 0 {
                return Err(ValidationError::new(
                    field,
                    format!("must be a positive integer, got {value}"),
                ));
            }
        }
        Ok(())
    }

    /// Pulls every field into its supported range.
    pub fn clamped(self) -> Self {
        Self {
            interval_secs: self.interval_secs.max(MIN_INTERVAL_SECS),
            max_concurrency: self.max_concurrency.clamp(1, MAX_CONCURRENCY),
            batch_limit: self.batch_limit.clamp(1, MAX_BATCH_LIMIT),
            timeout_secs: self.timeout_secs.clamp(1, MAX_TIMEOUT_SECS),
            retry_count: self.retry_count.clamp(0, MAX_RETRY_COUNT),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_INTERVAL_SECS) as u64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1) as u64)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1) as usize
    }

    pub fn retries(&self) -> u32 {
        self.retry_count.clamp(0, MAX_RETRY_COUNT) as u32
    }
}

/// Stored settings, or the defaults when nothing was saved yet.
pub async fn load_sync_settings(repository: &SourceRepository) -> Result<SyncSettings, StorageError> {
    let Some(raw) = repository.get_setting(SYNC_SETTINGS_KEY).await? else {
        return Ok(SyncSettings::default());
    };
    let parsed = serde_json::from_str::<SyncSettings>(&raw)
        .map_err(|error| StorageError::Corrupt(format!("{SYNC_SETTINGS_KEY}: {error}")))?;
    Ok(parsed.clamped())
}

/// Rejects non-positive values, clamps the rest and returns what was stored.
pub async fn save_sync_settings(
    repository: &SourceRepository,
    settings: SyncSettings,
) -> Result<SyncSettings, SettingsError> {
    settings.validate()?;
    let normalized = settings.clamped();
    let serialized = serde_json::to_string(&normalized)
        .map_err(|error| StorageError::Corrupt(error.to_string()))?;
    repository.set_setting(SYNC_SETTINGS_KEY, &serialized).await?;
    tracing::info!(
        interval_secs = normalized.interval_secs,
        max_concurrency = normalized.max_concurrency,
        batch_limit = normalized.batch_limit,
        "sync settings saved"
    );
    Ok(normalized)
}
