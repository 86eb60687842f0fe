//! Background title translation.
//!
//! Each tick takes the oldest untranslated entries, so a backlog drains in
//! publication order while sync keeps adding newer ones.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::content::pipeline::{ContentPipeline, PipelineError};
use crate::core::llm::client::LlmError;
use crate::core::llm::config::resolve_llm_config;
use crate::core::storage::repository::{SourceRepository, StorageError};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TickReport {
    pub translated: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TitleTranslationPoller {
    repository: SourceRepository,
    pipeline: ContentPipeline,
    interval: Duration,
    batch_size: i64,
    target_language: String,
}

impl TitleTranslationPoller {
    pub fn new(
        repository: SourceRepository,
        pipeline: ContentPipeline,
        interval: Duration,
        batch_size: i64,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            pipeline,
            interval,
            batch_size: batch_size.max(1),
            target_language: target_language.into(),
        }
    }

    /// Translates one batch. Per-entry failures are logged and counted on
    /// the entry; only a failure to read the queue is returned.
    pub async fn tick(&self) -> Result<TickReport, StorageError> {
        let config = match resolve_llm_config(None, &self.repository).await {
            Ok(config) => config,
            Err(error) => {
                tracing::debug!(%error, "title translation skipped, llm not configured");
                return Ok(TickReport::default());
            }
        };

        let entries = self
            .repository
            .list_untranslated_entries(self.batch_size)
            .await?;
        let mut report = TickReport::default();
        for entry in entries {
            match self
                .pipeline
                .translate_title(&config, &entry, &self.target_language)
                .await
            {
                Ok(_) => report.translated += 1,
                Err(PipelineError::Llm(LlmError::Auth(status))) => {
                    tracing::warn!(status, "title translation stopped, provider rejected credentials");
                    break;
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(entry_id = entry.id, %error, "title translation failed");
                    if let Err(error) = self.repository.record_translation_failure(entry.id).await {
                        tracing::error!(entry_id = entry.id, %error, "could not record translation failure");
                    }
                }
            }
        }

        if report != TickReport::default() {
            tracing::info!(
                translated = report.translated,
                failed = report.failed,
                "title translation tick"
            );
        }
        Ok(report)
    }

    /// Ticks until cancelled. A new tick never starts before the previous
    /// one has finished.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "title translation poller started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.tick() => {
                    if let Err(error) = result {
                        tracing::warn!(%error, "title translation tick failed");
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("title translation poller stopped");
    }
}
