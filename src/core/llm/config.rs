use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{SettingsError, ValidationError};
use crate::core::storage::repository::{SourceRepository, StorageError};

pub const LLM_CONFIG_KEY: &str = "llm_config";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Provider settings for an OpenAI-compatible endpoint.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl LlmConfig {
    /// Reads `RSSR_LLM_*`. Returns `None` unless base url, key and model are set.
    pub fn from_env() -> Option<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let timeout_secs = read("RSSR_LLM_TIMEOUT_SECS")
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Some(Self {
            base_url: read("RSSR_LLM_BASE_URL")?,
            api_key: read("RSSR_LLM_API_KEY")?,
            model: read("RSSR_LLM_MODEL")?,
            timeout_secs,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `{base_url}/chat/completions`, unless the base already names the endpoint.
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim().trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn trimmed(self) -> Self {
        Self {
            base_url: self.base_url.trim().to_string(),
            api_key: self.api_key.trim().to_string(),
            model: self.model.trim().to_string(),
            timeout_secs: self.timeout_secs,
        }
    }
}

pub fn validate_config(config: &LlmConfig) -> Result<(), ValidationError> {
    if config.base_url.trim().is_empty() {
        return Err(ValidationError::new("base_url", "must not be empty"));
    }
    let parsed = url::Url::parse(config.base_url.trim())
        .map_err(|error| ValidationError::new("base_url", error.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::new("base_url", "must be an http(s) url"));
    }
    if config.api_key.trim().is_empty() {
        return Err(ValidationError::new("api_key", "must not be empty"));
    }
    if config.model.trim().is_empty() {
        return Err(ValidationError::new("model", "must not be empty"));
    }
    if config.timeout_secs == 0 {
        return Err(ValidationError::new("timeout_secs", "must be positive"));
    }
    Ok(())
}

/// Saved configuration first, then the environment.
pub async fn get_saved_or_env_llm_config(
    repository: &SourceRepository,
) -> Result<Option<LlmConfig>, StorageError> {
    if let Some(raw) = repository.get_setting(LLM_CONFIG_KEY).await? {
        let parsed = serde_json::from_str::<LlmConfig>(&raw)
            .map_err(|error| StorageError::Corrupt(format!("{LLM_CONFIG_KEY}: {error}")))?;
        return Ok(Some(parsed));
    }
    Ok(LlmConfig::from_env())
}

/// An explicitly provided config wins over the stored one. Either way the
/// result has been validated.
pub async fn resolve_llm_config(
    provided: Option<LlmConfig>,
    repository: &SourceRepository,
) -> Result<LlmConfig, SettingsError> {
    let config = match provided {
        Some(config) => config,
        None => get_saved_or_env_llm_config(repository)
            .await?
            .ok_or_else(|| ValidationError::new("llm_config", "is not configured"))?,
    };
    validate_config(&config)?;
    Ok(config)
}

pub async fn save_llm_config(
    repository: &SourceRepository,
    config: LlmConfig,
) -> Result<LlmConfig, SettingsError> {
    let config = config.trimmed();
    validate_config(&config)?;
    let serialized = serde_json::to_string(&config)
        .map_err(|error| StorageError::Corrupt(error.to_string()))?;
    repository.set_setting(LLM_CONFIG_KEY, &serialized).await?;
    tracing::info!(base_url = %config.base_url, model = %config.model, "llm config saved");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            base_url: "https://api.example.com/v1".to_string(),
            api_key: "sk-secret".to_string(),
            model: "deepseek-chat".to_string(),
            timeout_secs: 30,
        }
    }

    #[test]
    fn debug_output_hides_the_key() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let cases = [
            (LlmConfig { base_url: " ".to_string(), ..config() }, "base_url"),
            (LlmConfig { base_url: "ftp://x.example.com".to_string(), ..config() }, "base_url"),
            (LlmConfig { api_key: String::new(), ..config() }, "api_key"),
            (LlmConfig { model: String::new(), ..config() }, "model"),
            (LlmConfig { timeout_secs: 0, ..config() }, "timeout_secs"),
        ];
        for (candidate, field) in cases {
            let error = validate_config(&candidate).expect_err("must be rejected");
            assert_eq!(error.field, field);
        }
        assert!(validate_config(&config()).is_ok());
    }

    #[test]
    fn endpoint_appends_chat_completions_once() {
        assert_eq!(
            config().endpoint(),
            "https://api.example.com/v1/chat/completions"
        );
        let explicit = LlmConfig {
            base_url: "https://api.example.com/v1/chat/completions/".to_string(),
            ..config()
        };
        assert_eq!(
            explicit.endpoint(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn saved_config_round_trips_through_settings() {
        let repository = SourceRepository::connect("sqlite::memory:")
            .await
            .expect("connect");
        let saved = save_llm_config(
            &repository,
            LlmConfig {
                model: "  deepseek-chat ".to_string(),
                ..config()
            },
        )
        .await
        .expect("save");
        let loaded = get_saved_or_env_llm_config(&repository)
            .await
            .expect("load")
            .expect("config exists");

        assert_eq!(saved.model, "deepseek-chat");
        assert_eq!(loaded, saved);
        assert_eq!(
            resolve_llm_config(None, &repository).await.expect("resolve"),
            saved
        );
    }

    #[tokio::test]
    async fn invalid_config_is_not_saved() {
        let repository = SourceRepository::connect("sqlite::memory:")
            .await
            .expect("connect");
        let result = save_llm_config(
            &repository,
            LlmConfig {
                api_key: String::new(),
                ..config()
            },
        )
        .await;
        assert!(matches!(result, Err(SettingsError::Validation(_))));
        assert_eq!(
            repository.get_setting(LLM_CONFIG_KEY).await.expect("read"),
            None
        );
    }
}
