use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::worker::{SyncSourceResult, SyncStatus};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncBatchResult {
    pub synced_sources: usize,
    pub failed_sources: usize,
    pub total_upserted_entries: usize,
}

impl SyncBatchResult {
    pub fn record(&mut self, result: &SyncSourceResult) {
        match result.status {
            SyncStatus::Failed => self.failed_sources += 1,
            SyncStatus::Updated | SyncStatus::NotModified => self.synced_sources += 1,
        }
        self.total_upserted_entries += result.upserted_entries;
    }
}

/// Live view of the scheduler. `progress` grows while a batch runs and
/// becomes `last_result` when it ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRuntimeStatus {
    pub running: bool,
    pub total_sources: usize,
    pub completed_sources: usize,
    pub progress: SyncBatchResult,
    pub last_result: Option<SyncBatchResult>,
    pub last_error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Shared handle to the process-wide status. Only the scheduler writes;
/// readers take cheap snapshots.
#[derive(Debug, Clone, Default)]
pub struct SyncStatusHandle {
    inner: Arc<RwLock<SyncRuntimeStatus>>,
}

impl SyncStatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> SyncRuntimeStatus {
        self.inner.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.running
    }

    /// Marks a batch as started. Returns `false` when one is already running.
    pub async fn begin(&self) -> bool {
        let mut status = self.inner.write().await;
        if status.running {
            return false;
        }
        status.running = true;
        status.total_sources = 0;
        status.completed_sources = 0;
        status.progress = SyncBatchResult::default();
        status.started_at = Some(now());
        status.finished_at = None;
        true
    }

    pub async fn set_total(&self, total_sources: usize) {
        self.inner.write().await.total_sources = total_sources;
    }

    pub async fn record_completion(&self, result: &SyncSourceResult) {
        let mut status = self.inner.write().await;
        status.completed_sources += 1;
        status.progress.record(result);
    }

    pub async fn finish(&self, result: SyncBatchResult) {
        let mut status = self.inner.write().await;
        status.running = false;
        status.progress = result;
        status.last_result = Some(result);
        status.last_error = None;
        status.finished_at = Some(now());
    }

    pub async fn fail(&self, message: impl Into<String>) {
        let mut status = self.inner.write().await;
        status.running = false;
        status.last_error = Some(message.into());
        status.finished_at = Some(now());
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
