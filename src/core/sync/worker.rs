use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::settings::SyncSettings;
use crate::core::feed::fetcher::{FetchClient, FetchOutcome, RetryPolicy};
use crate::core::feed::parser::parse_feed_bytes;
use crate::core::storage::models::{NewEntry, SourceRecord};
use crate::core::storage::repository::{SourceRepository, StorageError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Updated,
    NotModified,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSourceResult {
    pub source_id: i64,
    pub status: SyncStatus,
    pub upserted_entries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncSourceResult {
    pub(crate) fn failed(source_id: i64, error: String) -> Self {
        Self {
            source_id,
            status: SyncStatus::Failed,
            upserted_entries: 0,
            error: Some(error),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("source {0} not found")]
    SourceNotFound(i64),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One lock per source id so that two sync attempts on the same source are
/// serialized while different sources proceed in parallel.
#[derive(Debug, Clone, Default)]
pub struct SourceLocks {
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl SourceLocks {
    pub async fn acquire(&self, source_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(source_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops locks for sources nobody is waiting on.
    pub async fn prune(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Fetches, parses and merges a single source.
#[derive(Debug, Clone)]
pub struct SourceSyncWorker {
    repository: SourceRepository,
    client: FetchClient,
    locks: SourceLocks,
    backoff: RetryPolicy,
}

impl SourceSyncWorker {
    pub fn new(repository: SourceRepository, client: FetchClient) -> Self {
        Self {
            repository,
            client,
            locks: SourceLocks::default(),
            backoff: RetryPolicy::new(0),
        }
    }

    /// Overrides the retry delays; the retry count always comes from settings.
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn locks(&self) -> &SourceLocks {
        &self.locks
    }

    pub fn repository(&self) -> &SourceRepository {
        &self.repository
    }

    /// Feed failures are part of the result; only storage problems and a
    /// missing source are errors. Work done under the source lock is bounded
    /// by `timeout_secs`, retries included; running out counts as one failure.
    pub async fn sync(
        &self,
        source_id: i64,
        settings: &SyncSettings,
    ) -> Result<SyncSourceResult, WorkerError> {
        let _guard = self.locks.acquire(source_id).await;
        // Reloaded under the lock so validators written by a previous attempt are seen.
        let source = self
            .repository
            .get_source_by_id(source_id)
            .await?
            .ok_or(WorkerError::SourceNotFound(source_id))?;
        let deadline = settings.timeout();
        let result = match tokio::time::timeout(deadline, self.sync_locked(&source, settings)).await
        {
            Ok(result) => result?,
            Err(_) => {
                self.repository.increment_source_failure(source.id).await?;
                SyncSourceResult::failed(
                    source.id,
                    format!("timed out after {}s", deadline.as_secs()),
                )
            }
        };
        match result.status {
            SyncStatus::Failed => tracing::warn!(
                source_id,
                feed_url = %source.feed_url,
                error = result.error.as_deref().unwrap_or_default(),
                "source sync failed"
            ),
            status => tracing::debug!(
                source_id,
                ?status,
                upserted = result.upserted_entries,
                "source synced"
            ),
        }
        Ok(result)
    }

    async fn sync_locked(
        &self,
        source: &SourceRecord,
        settings: &SyncSettings,
    ) -> Result<SyncSourceResult, WorkerError> {
        let policy = RetryPolicy {
            retries: settings.retries(),
            ..self.backoff
        };
        let outcome = self
            .client
            .fetch(
                &source.feed_url,
                &source.validators(),
                settings.timeout(),
                &policy,
            )
            .await;

        let fetched = match outcome {
            FetchOutcome::NotModified => {
                self.repository
                    .update_source_sync_success(source.id, &source.validators())
                    .await?;
                return Ok(SyncSourceResult {
                    source_id: source.id,
                    status: SyncStatus::NotModified,
                    upserted_entries: 0,
                    error: None,
                });
            }
            FetchOutcome::Failed(failure) => {
                self.repository.increment_source_failure(source.id).await?;
                return Ok(SyncSourceResult::failed(source.id, failure.to_string()));
            }
            FetchOutcome::Modified(fetched) => fetched,
        };

        let parsed = match parse_feed_bytes(&fetched.body, fetched.content_type.as_deref()) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.repository.increment_source_failure(source.id).await?;
                return Ok(SyncSourceResult::failed(source.id, error.to_string()));
            }
        };

        let entries: Vec<NewEntry> = parsed.into_iter().map(NewEntry::from).collect();
        let upserted_entries = self.repository.upsert_entries(source.id, &entries).await?;
        self.repository
            .update_source_sync_success(source.id, &fetched.validators)
            .await?;

        Ok(SyncSourceResult {
            source_id: source.id,
            status: SyncStatus::Updated,
            upserted_entries,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::models::NewSource;
    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const ETAG_VALUE: &str = "\"abc\"";

    #[derive(Clone, Default)]
    struct Counters {
        feed: Arc<AtomicUsize>,
        broken: Arc<AtomicUsize>,
    }

    async fn feed_handler(State(counters): State<Counters>, headers: HeaderMap) -> Response {
        counters.feed.fetch_add(1, Ordering::SeqCst);
        if headers
            .get(header::IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok())
            == Some(ETAG_VALUE)
        {
            return StatusCode::NOT_MODIFIED.into_response();
        }
        (
            [
                (header::CONTENT_TYPE, "application/rss+xml"),
                (header::ETAG, ETAG_VALUE),
            ],
            include_str!("../../../fixtures/import-samples/sample.rss.xml"),
        )
            .into_response()
    }

    async fn broken_handler(State(counters): State<Counters>) -> StatusCode {
        counters.broken.fetch_add(1, Ordering::SeqCst);
        StatusCode::INTERNAL_SERVER_ERROR
    }

    async fn garbage_handler() -> &'static str {
        "<html><body>not a feed</body></html>"
    }

    async fn spawn_server() -> (String, Counters, tokio::task::JoinHandle<()>) {
        let counters = Counters::default();
        let app = Router::new()
            .route("/feed.xml", get(feed_handler))
            .route("/broken.xml", get(broken_handler))
            .route("/garbage.xml", get(garbage_handler))
            .with_state(counters.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let address = listener.local_addr().expect("local addr should exist");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });
        (format!("http://{address}"), counters, handle)
    }

    async fn worker_with_source(feed_url: &str) -> (SourceSyncWorker, i64) {
        let repository = SourceRepository::connect("sqlite::memory:")
            .await
            .expect("connect");
        let source = repository
            .upsert_source(&NewSource {
                title: "Test".to_string(),
                site_url: None,
                feed_url: feed_url.to_string(),
                category: None,
                is_active: true,
            })
            .await
            .expect("insert source");
        let worker = SourceSyncWorker::new(repository, FetchClient::new().expect("client"))
            .with_backoff(RetryPolicy::new(0).with_delays(
                Duration::from_millis(5),
                Duration::from_millis(20),
            ));
        (worker, source.id)
    }

    #[tokio::test]
    async fn conditional_resync_is_not_modified() {
        let (base, counters, server) = spawn_server().await;
        let (worker, source_id) = worker_with_source(&format!("{base}/feed.xml")).await;
        let settings = SyncSettings::default();

        let first = worker.sync(source_id, &settings).await.expect("first sync");
        let second = worker.sync(source_id, &settings).await.expect("second sync");
        let stored = worker
            .repository()
            .get_source_by_id(source_id)
            .await
            .expect("load")
            .expect("source exists");

        assert_eq!(first.status, SyncStatus::Updated);
        assert_eq!(first.upserted_entries, 2);
        assert_eq!(second.status, SyncStatus::NotModified);
        assert_eq!(second.upserted_entries, 0);
        assert_eq!(stored.etag.as_deref(), Some(ETAG_VALUE));
        assert_eq!(counters.feed.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn repeated_server_errors_count_as_one_failure() {
        let (base, counters, server) = spawn_server().await;
        let (worker, source_id) = worker_with_source(&format!("{base}/broken.xml")).await;
        let settings = SyncSettings {
            retry_count: 2,
            ..SyncSettings::default()
        };

        let result = worker.sync(source_id, &settings).await.expect("sync");
        let stored = worker
            .repository()
            .get_source_by_id(source_id)
            .await
            .expect("load")
            .expect("source exists");

        assert_eq!(result.status, SyncStatus::Failed);
        assert!(result.error.is_some());
        assert_eq!(counters.broken.load(Ordering::SeqCst), 3);
        assert_eq!(stored.failure_count, 1);
        server.abort();
    }

    #[tokio::test]
    async fn unparsable_body_is_a_failure_and_keeps_validators() {
        let (base, _, server) = spawn_server().await;
        let (worker, source_id) = worker_with_source(&format!("{base}/garbage.xml")).await;

        let result = worker
            .sync(source_id, &SyncSettings::default())
            .await
            .expect("sync");
        let stored = worker
            .repository()
            .get_source_by_id(source_id)
            .await
            .expect("load")
            .expect("source exists");

        assert_eq!(result.status, SyncStatus::Failed);
        assert_eq!(stored.failure_count, 1);
        assert_eq!(stored.etag, None);
        server.abort();
    }

    #[tokio::test]
    async fn unknown_source_is_an_error() {
        let (worker, _) = worker_with_source("https://example.com/feed.xml").await;
        let error = worker
            .sync(9_999, &SyncSettings::default())
            .await
            .expect_err("missing source");
        assert!(matches!(error, WorkerError::SourceNotFound(9_999)));
    }

    #[tokio::test]
    async fn source_locks_serialize_the_same_id() {
        let locks = SourceLocks::default();
        let guard = locks.acquire(1).await;
        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire(2)).await;
        assert!(other.is_ok(), "different ids must not block");
        drop(other);

        let same = tokio::time::timeout(Duration::from_millis(50), locks.acquire(1)).await;
        assert!(same.is_err(), "same id must wait");
        drop(guard);
        locks.prune().await;
        assert!(locks.locks.lock().await.is_empty());
    }
}
