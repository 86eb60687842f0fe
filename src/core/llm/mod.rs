pub mod client;
pub mod config;

use crate::core::storage::repository::SourceRepository;
use config::{get_saved_or_env_llm_config, validate_config};

#[derive(Debug, Clone)]
pub struct LlmService {
    repository: SourceRepository,
}

impl LlmService {
    pub fn new(repository: SourceRepository) -> Self {
        Self { repository }
    }

    pub fn name(&self) -> &'static str {
        "llm"
    }

    pub async fn status(&self) -> &'static str {
        match get_saved_or_env_llm_config(&self.repository).await {
            Ok(Some(config)) if validate_config(&config).is_ok() => "ready",
            Ok(_) => "unconfigured",
            Err(_) => "error",
        }
    }
}
