use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::extractor::{extract_with_fallback, ContentExtractor, ExtractedContent};
use crate::core::error::SettingsError;
use crate::core::llm::client::{LlmClient, LlmError, Prompt};
use crate::core::llm::config::{resolve_llm_config, LlmConfig};
use crate::core::storage::models::EntryRecord;
use crate::core::storage::repository::{SourceRepository, StorageError};

const MAX_INPUT_CHARS: usize = 8000;
const SUMMARY_TASK: &str = "summary";
const TITLE_ORIGIN: &str = "title";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("entry {0} not found")]
    EntryNotFound(i64),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<SettingsError> for PipelineError {
    fn from(error: SettingsError) -> Self {
        match error {
            SettingsError::Validation(inner) => Self::Llm(LlmError::InvalidConfig(inner)),
            SettingsError::Storage(inner) => Self::Storage(inner),
        }
    }
}

/// Text prepared for one model call plus the label of where it came from.
struct TaskInput {
    task: String,
    origin: &'static str,
    prompt: Prompt,
}

impl TaskInput {
    /// Covers everything that changes the model output, including where the
    /// article text came from.
    fn fingerprint(&self, model: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.task.as_str(),
            model,
            self.origin,
            self.prompt.system.as_str(),
            self.prompt.user.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"::");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Summaries and translations backed by the per-entry llm cache.
#[derive(Clone)]
pub struct ContentPipeline {
    repository: SourceRepository,
    llm: LlmClient,
    extractors: Arc<[Box<dyn ContentExtractor>]>,
    summary_language: String,
}

impl ContentPipeline {
    /// `extractors` are tried in order; the last one should not fail for
    /// entries that carry any feed text.
    pub fn new(
        repository: SourceRepository,
        llm: LlmClient,
        extractors: Vec<Box<dyn ContentExtractor>>,
        summary_language: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            llm,
            extractors: Arc::from(extractors),
            summary_language: summary_language.into(),
        }
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    pub async fn summarize(&self, entry_id: i64) -> Result<String, PipelineError> {
        let config = resolve_llm_config(None, &self.repository).await?;
        let entry = self.load_entry(entry_id).await?;
        let output = self
            .run_for_entry(&config, &entry, |content| self.summary_input(&entry, content))
            .await?;
        if entry.ai_summary.as_deref() != Some(output.as_str()) {
            self.repository.set_entry_ai_summary(entry.id, &output).await?;
        }
        Ok(output)
    }

    pub async fn translate_entry(
        &self,
        entry_id: i64,
        target_language: &str,
    ) -> Result<String, PipelineError> {
        let config = resolve_llm_config(None, &self.repository).await?;
        let entry = self.load_entry(entry_id).await?;
        self.run_for_entry(&config, &entry, |content| {
            translation_input(&entry, content, target_language)
        })
        .await
    }

    /// Translates only the title and stores it on the entry.
    pub async fn translate_title(
        &self,
        config: &LlmConfig,
        entry: &EntryRecord,
        target_language: &str,
    ) -> Result<String, PipelineError> {
        let input = TaskInput {
            task: format!("title:{}", target_language.trim().to_lowercase()),
            origin: TITLE_ORIGIN,
            prompt: Prompt::new(
                "You translate article titles. Reply with the translated title only.",
                format!("Translate this title into {target_language}:\n\n{}", entry.title),
            ),
        };
        let output = match self.cached(config, entry.id, &input).await? {
            Some(cached) => cached,
            None => self.complete_and_store(config, entry.id, &input).await?,
        };
        self.repository.set_translated_title(entry.id, &output).await?;
        Ok(output)
    }

    fn summary_input(&self, entry: &EntryRecord, content: Option<&ExtractedContent>) -> TaskInput {
        TaskInput {
            task: SUMMARY_TASK.to_string(),
            origin: content_origin(content),
            prompt: Prompt::new(
                format!(
                    "You summarize articles for a feed reader. Write in {}.",
                    self.summary_language
                ),
                format!(
                    "Summarize the following article in at most 5 short bullet points.\n\n{}",
                    build_entry_input(entry, content)
                ),
            ),
        }
    }

    async fn load_entry(&self, entry_id: i64) -> Result<EntryRecord, PipelineError> {
        self.repository
            .get_entry_by_id(entry_id)
            .await?
            .ok_or(PipelineError::EntryNotFound(entry_id))
    }

    /// Answers from the cache when possible; the article page is only fetched
    /// on a miss.
    async fn run_for_entry<F>(
        &self,
        config: &LlmConfig,
        entry: &EntryRecord,
        build: F,
    ) -> Result<String, PipelineError>
    where
        F: Fn(Option<&ExtractedContent>) -> TaskInput,
    {
        if let Some(cached) = self.cached_result(config, entry, &build).await? {
            return Ok(cached);
        }
        let content = extract_with_fallback(&self.extractors, entry).await;
        let input = build(content.as_ref());
        self.complete_and_store(config, entry.id, &input).await
    }

    /// Walks the extractors in priority order without touching the network.
    /// Remote origins match on their newest stored output; local ones are
    /// rebuilt and matched on the exact fingerprint.
    async fn cached_result<F>(
        &self,
        config: &LlmConfig,
        entry: &EntryRecord,
        build: &F,
    ) -> Result<Option<String>, StorageError>
    where
        F: Fn(Option<&ExtractedContent>) -> TaskInput,
    {
        let task = build(None).task;
        for extractor in self.extractors.iter() {
            let origin = extractor.origin();
            if extractor.requires_network() {
                let hit = self
                    .repository
                    .find_llm_cache_by_origin(entry.id, &task, origin.as_str(), &config.model)
                    .await?;
                if hit.is_some() {
                    tracing::debug!(entry_id = entry.id, %task, origin = origin.as_str(), "llm cache hit");
                    return Ok(hit);
                }
                continue;
            }
            if let Ok(text) = extractor.extract(entry).await {
                let content = ExtractedContent { origin, text };
                return self.cached(config, entry.id, &build(Some(&content))).await;
            }
        }
        self.cached(config, entry.id, &build(None)).await
    }

    async fn cached(
        &self,
        config: &LlmConfig,
        entry_id: i64,
        input: &TaskInput,
    ) -> Result<Option<String>, StorageError> {
        let hit = self
            .repository
            .get_llm_cache(entry_id, &input.task, &input.fingerprint(&config.model))
            .await?;
        if hit.is_some() {
            tracing::debug!(entry_id, task = %input.task, origin = input.origin, "llm cache hit");
        }
        Ok(hit)
    }

    async fn complete_and_store(
        &self,
        config: &LlmConfig,
        entry_id: i64,
        input: &TaskInput,
    ) -> Result<String, PipelineError> {
        tracing::debug!(entry_id, task = %input.task, origin = input.origin, "llm cache miss");
        let output = self.llm.complete(config, &input.prompt).await?;
        self.repository
            .set_llm_cache(
                entry_id,
                &input.task,
                &input.fingerprint(&config.model),
                input.origin,
                &config.model,
                &output,
            )
            .await?;
        Ok(output)
    }
}

fn translation_input(
    entry: &EntryRecord,
    content: Option<&ExtractedContent>,
    target_language: &str,
) -> TaskInput {
    TaskInput {
        task: format!("translate:{}", target_language.trim().to_lowercase()),
        origin: content_origin(content),
        prompt: Prompt::new(
            "You are a professional technical translator.",
            format!(
                "Translate the following article into {target_language}. Keep formatting simple and readable.\n\n{}",
                build_entry_input(entry, content)
            ),
        ),
    }
}

fn content_origin(content: Option<&ExtractedContent>) -> &'static str {
    content
        .map(|content| content.origin.as_str())
        .unwrap_or("title_only")
}

fn build_entry_input(entry: &EntryRecord, content: Option<&ExtractedContent>) -> String {
    let mut blocks = vec![
        format!("Title: {}", entry.title),
        format!("Link: {}", entry.link),
    ];
    if let Some(content) = content {
        let text = content.text.chars().take(MAX_INPUT_CHARS).collect::<String>();
        blocks.push(format!("Content:\n{text}"));
    }
    blocks.join("\n\n")
}
