use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::settings::{load_sync_settings, SyncSettings};
use super::status::{SyncBatchResult, SyncRuntimeStatus, SyncStatusHandle};
use super::worker::{SourceSyncWorker, SyncSourceResult, WorkerError};
use crate::core::storage::repository::{SourceRepository, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("a sync batch is already running")]
    AlreadyRunning,
}

/// Runs bounded-concurrency batches over the active sources and owns the
/// runtime status they publish.
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    worker: SourceSyncWorker,
    status: SyncStatusHandle,
}

impl SyncScheduler {
    pub fn new(worker: SourceSyncWorker) -> Self {
        Self {
            worker,
            status: SyncStatusHandle::new(),
        }
    }

    pub fn status(&self) -> &SyncStatusHandle {
        &self.status
    }

    fn repository(&self) -> &SourceRepository {
        self.worker.repository()
    }

    /// Runs one batch to completion. Fails fast with `AlreadyRunning` instead
    /// of starting a second batch.
    pub async fn run_batch(&self) -> Result<SyncBatchResult, SchedulerError> {
        if !self.status.begin().await {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.drive_batch().await
    }

    /// Starts a batch in the background and returns the status right away.
    /// When a batch is already in flight nothing new is started.
    pub async fn spawn_batch(&self) -> SyncRuntimeStatus {
        if self.status.begin().await {
            let scheduler = self.clone();
            tokio::spawn(async move {
                if let Err(error) = scheduler.drive_batch().await {
                    tracing::warn!(%error, "background sync batch failed");
                }
            });
        } else {
            tracing::debug!("sync batch already running, not starting another");
        }
        self.status.snapshot().await
    }

    /// Syncs a single source outside of any batch. Waits for an in-flight
    /// attempt on the same source to finish first.
    pub async fn sync_one(&self, source_id: i64) -> Result<SyncSourceResult, SchedulerError> {
        let settings = load_sync_settings(self.repository()).await?;
        Ok(self.worker.sync(source_id, &settings).await?)
    }

    /// Re-runs the batch every `interval_secs` until cancelled. The interval
    /// is re-read after every batch so saved settings apply on the next tick.
    pub async fn run_periodic(&self, cancel: CancellationToken) {
        tracing::info!("sync scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if self.status.is_running().await {
                        self.status.fail("sync cancelled").await;
                    }
                    break;
                }
                result = self.run_batch() => match result {
                    Ok(_) | Err(SchedulerError::AlreadyRunning) => {}
                    Err(error) => tracing::warn!(%error, "scheduled sync batch failed"),
                },
            }

            let interval = match load_sync_settings(self.repository()).await {
                Ok(settings) => settings.interval(),
                Err(error) => {
                    tracing::warn!(%error, "could not load sync settings, using defaults");
                    SyncSettings::default().interval()
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("sync scheduler stopped");
    }

    /// Expects `status.begin()` to have succeeded.
    async fn drive_batch(&self) -> Result<SyncBatchResult, SchedulerError> {
        match self.dispatch().await {
            Ok(result) => {
                self.status.finish(result).await;
                self.worker.locks().prune().await;
                tracing::info!(
                    synced = result.synced_sources,
                    failed = result.failed_sources,
                    upserted = result.total_upserted_entries,
                    "sync batch finished"
                );
                Ok(result)
            }
            Err(error) => {
                self.status.fail(error.to_string()).await;
                Err(error)
            }
        }
    }

    async fn dispatch(&self) -> Result<SyncBatchResult, SchedulerError> {
        let settings = load_sync_settings(self.repository()).await?;
        let sources = self
            .repository()
            .list_sync_candidates(settings.batch_limit)
            .await?;
        self.status.set_total(sources.len()).await;
        tracing::info!(
            sources = sources.len(),
            max_concurrency = settings.max_concurrency,
            "sync batch started"
        );

        let permits = Arc::new(Semaphore::new(settings.concurrency()));
        let mut tasks = JoinSet::new();
        let mut owners = HashMap::with_capacity(sources.len());
        for source in sources {
            let worker = self.worker.clone();
            let permits = permits.clone();
            let source_id = source.id;
            let handle = tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return SyncSourceResult::failed(source.id, "scheduler shut down".to_string());
                };
                match worker.sync(source.id, &settings).await {
                    Ok(result) => result,
                    Err(error) => SyncSourceResult::failed(source.id, error.to_string()),
                }
            });
            owners.insert(handle.id(), source_id);
        }

        // Completions are folded in one at a time, so readers only ever see
        // the completed count grow.
        let mut batch = SyncBatchResult::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            let result = joined_result(joined, &owners);
            batch.record(&result);
            self.status.record_completion(&result).await;
        }
        Ok(batch)
    }
}

/// A task that panicked or was aborted is charged to the source it was
/// spawned for.
fn joined_result(
    joined: Result<(Id, SyncSourceResult), JoinError>,
    owners: &HashMap<Id, i64>,
) -> SyncSourceResult {
    match joined {
        Ok((_, result)) => result,
        Err(error) => {
            let source_id = owners.get(&error.id()).copied().unwrap_or_default();
            tracing::error!(source_id, %error, "sync task aborted");
            SyncSourceResult::failed(source_id, error.to_string())
        }
    }
}
