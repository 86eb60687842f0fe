use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::models::{EntryRecord, NewEntry, NewSource, SourceRecord};
use crate::core::feed::fetcher::Validators;
use crate::core::normalize::canonicalize;

/// Entries that failed translation this many times are left alone.
pub const MAX_TRANSLATE_FAILURES: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct SourceRepository {
    pool: SqlitePool,
}

impl SourceRepository {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // A single connection keeps `sqlite::memory:` databases alive and
        // serializes writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!("storage ready");
        Ok(Self { pool })
    }

    /// Creates or updates a source keyed by its canonical feed URL.
    pub async fn upsert_source(&self, source: &NewSource) -> Result<SourceRecord, StorageError> {
        let feed_url = canonicalize(&source.feed_url).into_string();
        sqlx::query(
            r#"
            INSERT INTO sources (title, site_url, feed_url, category, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(feed_url) DO UPDATE SET
              title = excluded.title,
              site_url = excluded.site_url,
              category = excluded.category,
              is_active = excluded.is_active,
              updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            "#,
        )
        .bind(&source.title)
        .bind(&source.site_url)
        .bind(&feed_url)
        .bind(&source.category)
        .bind(i64::from(source.is_active))
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT id, title, site_url, feed_url, category, is_active, failure_count, etag, last_modified, last_synced_at, last_attempt_at, created_at, updated_at
            FROM sources
            WHERE feed_url = ?1
            "#,
        )
        .bind(&feed_url)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Inserts sources whose canonical feed URL is not stored yet and leaves
    /// existing rows untouched. Returns the number of rows inserted.
    pub async fn insert_new_sources(&self, sources: &[NewSource]) -> Result<usize, StorageError> {
        let mut inserted = 0_usize;
        for source in sources {
            let affected = sqlx::query(
                r#"
                INSERT INTO sources (title, site_url, feed_url, category, is_active)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(feed_url) DO NOTHING
                "#,
            )
            .bind(&source.title)
            .bind(&source.site_url)
            .bind(canonicalize(&source.feed_url).as_str())
            .bind(&source.category)
            .bind(i64::from(source.is_active))
            .execute(&self.pool)
            .await?
            .rows_affected();
            inserted += affected as usize;
        }
        Ok(inserted)
    }

    pub async fn list_sources(&self) -> Result<Vec<SourceRecord>, StorageError> {
        let rows = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT id, title, site_url, feed_url, category, is_active, failure_count, etag, last_modified, last_synced_at, last_attempt_at, created_at, updated_at
            FROM sources
            ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active sources, least recently attempted first.
    pub async fn list_sync_candidates(&self, limit: i64) -> Result<Vec<SourceRecord>, StorageError> {
        let rows = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT id, title, site_url, feed_url, category, is_active, failure_count, etag, last_modified, last_synced_at, last_attempt_at, created_at, updated_at
            FROM sources
            WHERE is_active = 1
            ORDER BY last_attempt_at IS NOT NULL, last_attempt_at ASC, id ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Entries are removed with their source through the foreign key cascade.
    pub async fn delete_source(&self, id: i64) -> Result<u64, StorageError> {
        let affected = sqlx::query("DELETE FROM sources WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    pub async fn set_sources_active(
        &self,
        source_ids: &[i64],
        is_active: bool,
    ) -> Result<u64, StorageError> {
        if source_ids.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE sources SET is_active = ");
        query.push_bind(i64::from(is_active));
        query.push(", updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id IN (");
        let mut separated = query.separated(", ");
        for source_id in source_ids {
            separated.push_bind(*source_id);
        }
        separated.push_unseparated(")");

        let affected = query.build().execute(&self.pool).await?.rows_affected();
        Ok(affected)
    }

    pub async fn get_source_by_id(&self, id: i64) -> Result<Option<SourceRecord>, StorageError> {
        let row = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT id, title, site_url, feed_url, category, is_active, failure_count, etag, last_modified, last_synced_at, last_attempt_at, created_at, updated_at
            FROM sources
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_source_sync_success(
        &self,
        source_id: i64,
        validators: &Validators,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sources
            SET etag = ?1,
                last_modified = ?2,
                last_synced_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
                last_attempt_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
                failure_count = 0,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?3
            "#,
        )
        .bind(&validators.etag)
        .bind(&validators.last_modified)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Counts one failed attempt; validators and entries stay as they were.
    pub async fn increment_source_failure(&self, source_id: i64) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sources
            SET failure_count = failure_count + 1,
                last_attempt_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?1
            "#,
        )
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Merges entries for one source. Rows are only rewritten when a feed
    /// field changed, so the return value counts inserted or changed rows.
    /// Reader state (`is_read`, `is_starred`) is never touched; a changed
    /// title clears the stale translation.
    pub async fn upsert_entries(
        &self,
        source_id: i64,
        entries: &[NewEntry],
    ) -> Result<usize, StorageError> {
        let mut transaction = self.pool.begin().await?;
        let mut affected = 0_usize;
        for entry in entries {
            let changed = sqlx::query(
                r#"
                INSERT INTO entries (source_id, dedup_key, guid, link, title, summary, content, published_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(source_id, dedup_key) DO UPDATE SET
                  guid = excluded.guid,
                  link = excluded.link,
                  title = excluded.title,
                  translated_title = CASE
                    WHEN entries.title IS excluded.title THEN entries.translated_title
                    ELSE NULL
                  END,
                  translate_failures = CASE
                    WHEN entries.title IS excluded.title THEN entries.translate_failures
                    ELSE 0
                  END,
                  summary = excluded.summary,
                  content = excluded.content,
                  published_at = excluded.published_at
                WHERE entries.guid IS NOT excluded.guid
                   OR entries.link IS NOT excluded.link
                   OR entries.title IS NOT excluded.title
                   OR entries.summary IS NOT excluded.summary
                   OR entries.content IS NOT excluded.content
                   OR entries.published_at IS NOT excluded.published_at
                "#,
            )
            .bind(source_id)
            .bind(&entry.dedup_key)
            .bind(&entry.guid)
            .bind(&entry.link)
            .bind(&entry.title)
            .bind(&entry.summary)
            .bind(&entry.content)
            .bind(&entry.published_at)
            .execute(&mut *transaction)
            .await?
            .rows_affected();
            affected += changed as usize;
        }
        transaction.commit().await?;
        Ok(affected)
    }

    pub async fn list_entries(
        &self,
        source_id: Option<i64>,
        search: Option<&str>,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<EntryRecord>, StorageError> {
        let keyword = search.unwrap_or("").trim().to_string();
        let rows = sqlx::query_as::<_, EntryRecord>(
            r#"
            SELECT
              e.id,
              e.source_id,
              s.title AS source_title,
              e.dedup_key,
              e.guid,
              e.link,
              e.title,
              e.translated_title,
              e.summary,
              e.ai_summary,
              e.content,
              e.published_at,
              e.is_read,
              e.is_starred,
              e.created_at
            FROM entries e
            JOIN sources s ON s.id = e.source_id
            WHERE (?1 IS NULL OR e.source_id = ?1)
              AND (?2 = ''
                OR e.title LIKE '%' || ?2 || '%'
                OR IFNULL(e.translated_title, '') LIKE '%' || ?2 || '%'
                OR IFNULL(e.summary, '') LIKE '%' || ?2 || '%')
              AND (?3 = 0 OR e.is_read = 0)
            ORDER BY COALESCE(e.published_at, e.created_at) DESC, e.id DESC
            LIMIT ?4
            "#,
        )
        .bind(source_id)
        .bind(keyword)
        .bind(i64::from(unread_only))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_entry_by_id(&self, entry_id: i64) -> Result<Option<EntryRecord>, StorageError> {
        let row = sqlx::query_as::<_, EntryRecord>(
            r#"
            SELECT
              e.id, e.source_id, s.title AS source_title, e.dedup_key, e.guid, e.link, e.title,
              e.translated_title, e.summary, e.ai_summary, e.content, e.published_at,
              e.is_read, e.is_starred, e.created_at
            FROM entries e
            JOIN sources s ON s.id = e.source_id
            WHERE e.id = ?1
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn mark_entry_read(&self, entry_id: i64, is_read: bool) -> Result<u64, StorageError> {
        let affected = sqlx::query("UPDATE entries SET is_read = ?1 WHERE id = ?2")
            .bind(i64::from(is_read))
            .bind(entry_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    /// Entries still lacking a translated title, oldest first.
    pub async fn list_untranslated_entries(
        &self,
        limit: i64,
    ) -> Result<Vec<EntryRecord>, StorageError> {
        let rows = sqlx::query_as::<_, EntryRecord>(
            r#"
            SELECT
              e.id, e.source_id, s.title AS source_title, e.dedup_key, e.guid, e.link, e.title,
              e.translated_title, e.summary, e.ai_summary, e.content, e.published_at,
              e.is_read, e.is_starred, e.created_at
            FROM entries e
            JOIN sources s ON s.id = e.source_id
            WHERE e.translated_title IS NULL
              AND e.translate_failures < ?1
            ORDER BY COALESCE(e.published_at, e.created_at) ASC, e.id ASC
            LIMIT ?2
            "#,
        )
        .bind(MAX_TRANSLATE_FAILURES)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_translated_title(
        &self,
        entry_id: i64,
        translated_title: &str,
    ) -> Result<u64, StorageError> {
        let affected = sqlx::query("UPDATE entries SET translated_title = ?1 WHERE id = ?2")
            .bind(translated_title)
            .bind(entry_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    pub async fn record_translation_failure(&self, entry_id: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE entries SET translate_failures = translate_failures + 1 WHERE id = ?1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_entry_ai_summary(
        &self,
        entry_id: i64,
        summary: &str,
    ) -> Result<u64, StorageError> {
        let affected = sqlx::query("UPDATE entries SET ai_summary = ?1 WHERE id = ?2")
            .bind(summary)
            .bind(entry_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    pub async fn get_llm_cache(
        &self,
        entry_id: i64,
        task: &str,
        fingerprint: &str,
    ) -> Result<Option<String>, StorageError> {
        let output = sqlx::query_scalar::<_, String>(
            r#"
            SELECT output
            FROM llm_cache
            WHERE entry_id = ?1 AND task = ?2 AND fingerprint = ?3
            "#,
        )
        .bind(entry_id)
        .bind(task)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(output)
    }

    /// Newest output produced from content of the given origin, whatever its
    /// fingerprint. Used for origins whose text cannot be rebuilt offline.
    pub async fn find_llm_cache_by_origin(
        &self,
        entry_id: i64,
        task: &str,
        origin: &str,
        model: &str,
    ) -> Result<Option<String>, StorageError> {
        let output = sqlx::query_scalar::<_, String>(
            r#"
            SELECT output
            FROM llm_cache
            WHERE entry_id = ?1 AND task = ?2 AND origin = ?3 AND model = ?4
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(entry_id)
        .bind(task)
        .bind(origin)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;
        Ok(output)
    }

    pub async fn set_llm_cache(
        &self,
        entry_id: i64,
        task: &str,
        fingerprint: &str,
        origin: &str,
        model: &str,
        output: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO llm_cache (entry_id, task, fingerprint, origin, model, output)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(entry_id, task, fingerprint) DO UPDATE SET
              origin = excluded.origin,
              model = excluded.model,
              output = excluded.output,
              created_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            "#,
        )
        .bind(entry_id)
        .bind(task)
        .bind(fingerprint)
        .bind(origin)
        .bind(model)
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value)
            VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET
              value = excluded.value,
              updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    fn make_source(title: &str, feed_url: &str) -> NewSource {
        NewSource {
            title: title.to_string(),
            site_url: Some("https://example.com".to_string()),
            feed_url: feed_url.to_string(),
            category: Some("tech".to_string()),
            is_active: true,
        }
    }

    fn make_entry(key: &str, title: &str, published_at: Option<&str>) -> NewEntry {
        NewEntry {
            dedup_key: format!("id::{key}"),
            guid: Some(key.to_string()),
            link: format!("https://reader.example.com/posts/{key}"),
            title: title.to_string(),
            summary: Some(format!("{title} summary")),
            content: Some(format!("{title} content")),
            published_at: published_at.map(ToString::to_string),
        }
    }

    async fn repository() -> SourceRepository {
        SourceRepository::connect("sqlite::memory:")
            .await
            .expect("connect must succeed")
    }

    #[tokio::test]
    async fn migration_creates_required_tables() {
        let repository = repository().await;
        let rows = sqlx::query(
            r#"
            SELECT name
            FROM sqlite_master
            WHERE type = 'table'
              AND name IN ('sources', 'entries', 'llm_cache', 'settings')
            ORDER BY name
            "#,
        )
        .fetch_all(&repository.pool)
        .await
        .expect("query must succeed");

        let table_names: Vec<String> = rows
            .into_iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();
        assert_eq!(
            table_names,
            vec![
                "entries".to_string(),
                "llm_cache".to_string(),
                "settings".to_string(),
                "sources".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn upsert_source_is_idempotent_for_equivalent_feed_urls() {
        let repository = repository().await;
        let first = repository
            .upsert_source(&make_source("Hacker News", "https://news.ycombinator.com/rss"))
            .await
            .expect("first upsert must succeed");
        let second = repository
            .upsert_source(&make_source("HN Updated", "HTTPS://News.YCombinator.com/rss/#top"))
            .await
            .expect("second upsert must succeed");

        let all = repository.list_sources().await.expect("list must succeed");

        assert_eq!(all.len(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(all[0].title, "HN Updated");
        assert_eq!(all[0].feed_url, "https://news.ycombinator.com/rss");
    }

    #[tokio::test]
    async fn insert_new_sources_keeps_existing_rows() {
        let repository = repository().await;
        repository
            .upsert_source(&make_source("Original", "https://a.com/feed.xml"))
            .await
            .expect("seed");

        let inserted = repository
            .insert_new_sources(&[
                make_source("Renamed", "https://a.com/feed.xml"),
                make_source("B", "https://b.com/feed.xml"),
            ])
            .await
            .expect("insert should succeed");
        let rows = repository.list_sources().await.expect("list");

        assert_eq!(inserted, 1);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|row| row.title == "Original"));
    }

    #[tokio::test]
    async fn delete_source_cascades_to_entries() {
        let repository = repository().await;
        let created = repository
            .upsert_source(&make_source("Rust Blog", "https://blog.rust-lang.org/feed.xml"))
            .await
            .expect("create must succeed");
        repository
            .upsert_entries(created.id, &[make_entry("a", "A", None)])
            .await
            .expect("entries");

        let affected = repository
            .delete_source(created.id)
            .await
            .expect("delete must succeed");
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&repository.pool)
            .await
            .expect("count");

        assert_eq!(affected, 1);
        assert_eq!(remaining, 0);
        assert!(repository.list_sources().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn set_sources_active_updates_batch_rows() {
        let repository = repository().await;
        let first = repository
            .upsert_source(&make_source("A", "https://a.com/feed.xml"))
            .await
            .expect("create A");
        let second = repository
            .upsert_source(&make_source("B", "https://b.com/feed.xml"))
            .await
            .expect("create B");

        let affected = repository
            .set_sources_active(&[first.id, second.id], false)
            .await
            .expect("batch update should succeed");
        let rows = repository.list_sources().await.expect("list should succeed");
        let candidates = repository.list_sync_candidates(10).await.expect("candidates");

        assert_eq!(affected, 2);
        assert!(rows.iter().all(|row| row.is_active == 0));
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn sync_candidates_put_never_attempted_sources_first() {
        let repository = repository().await;
        let stale = repository
            .upsert_source(&make_source("A", "https://a.com/feed.xml"))
            .await
            .expect("create A");
        let fresh = repository
            .upsert_source(&make_source("B", "https://b.com/feed.xml"))
            .await
            .expect("create B");
        repository
            .update_source_sync_success(stale.id, &Validators::default())
            .await
            .expect("mark synced");

        let candidates = repository.list_sync_candidates(10).await.expect("candidates");
        let limited = repository.list_sync_candidates(1).await.expect("limited");

        assert_eq!(
            candidates.iter().map(|row| row.id).collect::<Vec<_>>(),
            vec![fresh.id, stale.id]
        );
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, fresh.id);
    }

    #[tokio::test]
    async fn failure_and_success_bookkeeping() {
        let repository = repository().await;
        let source = repository
            .upsert_source(&make_source("A", "https://a.com/feed.xml"))
            .await
            .expect("create");
        let validators = Validators::new(Some("\"v1\"".to_string()), None);
        repository
            .update_source_sync_success(source.id, &validators)
            .await
            .expect("success");
        repository.increment_source_failure(source.id).await.expect("fail 1");
        repository.increment_source_failure(source.id).await.expect("fail 2");

        let row = repository
            .get_source_by_id(source.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(row.failure_count, 2);
        assert_eq!(row.validators(), validators);

        repository
            .update_source_sync_success(source.id, &validators)
            .await
            .expect("success again");
        let row = repository
            .get_source_by_id(source.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(row.failure_count, 0);
        assert!(row.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn entry_upsert_counts_only_changed_rows_and_keeps_reader_state() {
        let repository = repository().await;
        let source = repository
            .upsert_source(&make_source("Reader Source", "https://reader.example.com/feed.xml"))
            .await
            .expect("source create should succeed");
        let entries = vec![
            make_entry("1", "Rust release", Some("2026-02-24T00:00:00Z")),
            make_entry("2", "AI news", Some("2026-02-24T01:00:00Z")),
        ];

        let first = repository
            .upsert_entries(source.id, &entries)
            .await
            .expect("first upsert");
        let all = repository
            .list_entries(Some(source.id), None, false, 50)
            .await
            .expect("list all should succeed");
        let rust_entry = all.iter().find(|entry| entry.title == "Rust release").expect("rust");
        repository
            .mark_entry_read(rust_entry.id, true)
            .await
            .expect("mark read");
        repository
            .set_translated_title(rust_entry.id, "Rust 发布")
            .await
            .expect("translate");

        let unchanged = repository
            .upsert_entries(source.id, &entries)
            .await
            .expect("second upsert");
        let mut edited = entries.clone();
        edited[0].summary = Some("Rust update, revised".to_string());
        let changed = repository
            .upsert_entries(source.id, &edited)
            .await
            .expect("third upsert");

        let after = repository
            .get_entry_by_id(rust_entry.id)
            .await
            .expect("get")
            .expect("exists");
        let count = repository
            .list_entries(Some(source.id), None, false, 50)
            .await
            .expect("list")
            .len();

        assert_eq!(first, 2);
        assert_eq!(unchanged, 0);
        assert_eq!(changed, 1);
        assert_eq!(count, 2);
        assert_eq!(after.is_read, 1);
        assert_eq!(after.summary.as_deref(), Some("Rust update, revised"));
        assert_eq!(after.translated_title.as_deref(), Some("Rust 发布"));
    }

    #[tokio::test]
    async fn retitled_entries_lose_their_translation() {
        let repository = repository().await;
        let source = repository
            .upsert_source(&make_source("S", "https://s.example.com/feed.xml"))
            .await
            .expect("source");
        repository
            .upsert_entries(source.id, &[make_entry("1", "Old title", None)])
            .await
            .expect("insert");
        let entry = repository
            .list_entries(Some(source.id), None, false, 10)
            .await
            .expect("list")
            .remove(0);
        repository
            .set_translated_title(entry.id, "旧标题")
            .await
            .expect("translate");

        repository
            .upsert_entries(source.id, &[make_entry("1", "New title", None)])
            .await
            .expect("retitle");
        let after = repository
            .get_entry_by_id(entry.id)
            .await
            .expect("get")
            .expect("exists");

        assert_eq!(after.title, "New title");
        assert_eq!(after.translated_title, None);
    }

    #[tokio::test]
    async fn search_and_read_filters() {
        let repository = repository().await;
        let source = repository
            .upsert_source(&make_source("Reader", "https://reader.example.com/feed.xml"))
            .await
            .expect("source");
        repository
            .upsert_entries(
                source.id,
                &[
                    make_entry("1", "Rust release", Some("2026-02-24T00:00:00Z")),
                    make_entry("2", "AI news", Some("2026-02-24T01:00:00Z")),
                ],
            )
            .await
            .expect("entries");

        let all = repository
            .list_entries(None, None, false, 50)
            .await
            .expect("all");
        let rust_only = repository
            .list_entries(Some(source.id), Some("Rust"), false, 50)
            .await
            .expect("search should succeed");
        repository.mark_entry_read(all[0].id, true).await.expect("read");
        let unread = repository
            .list_entries(Some(source.id), None, true, 50)
            .await
            .expect("unread filter should succeed");

        assert_eq!(all[0].title, "AI news");
        assert_eq!(rust_only.len(), 1);
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].title, "Rust release");
    }

    #[tokio::test]
    async fn list_entries_respects_limit_for_large_dataset() {
        let repository = repository().await;
        let source = repository
            .upsert_source(&make_source("Perf Source", "https://perf.example.com/feed.xml"))
            .await
            .expect("source create should succeed");
        let entries: Vec<NewEntry> = (0..120)
            .map(|index| make_entry(&index.to_string(), &format!("Entry {index}"), None))
            .collect();

        let upserted = repository
            .upsert_entries(source.id, &entries)
            .await
            .expect("entry upsert should succeed");
        let limited = repository
            .list_entries(Some(source.id), None, false, 50)
            .await
            .expect("list should succeed");

        assert_eq!(upserted, 120);
        assert_eq!(limited.len(), 50);
    }

    #[tokio::test]
    async fn untranslated_entries_come_oldest_first_and_skip_repeat_failures() {
        let repository = repository().await;
        let source = repository
            .upsert_source(&make_source("S", "https://s.example.com/feed.xml"))
            .await
            .expect("source");
        repository
            .upsert_entries(
                source.id,
                &[
                    make_entry("new", "Newest", Some("2026-02-24T12:00:00Z")),
                    make_entry("old", "Oldest", Some("2020-01-01T00:00:00Z")),
                    make_entry("mid", "Middle", Some("2024-06-01T00:00:00Z")),
                ],
            )
            .await
            .expect("entries");

        let queue = repository.list_untranslated_entries(10).await.expect("queue");
        assert_eq!(
            queue.iter().map(|entry| entry.title.as_str()).collect::<Vec<_>>(),
            vec!["Oldest", "Middle", "Newest"]
        );

        for _ in 0..MAX_TRANSLATE_FAILURES {
            repository
                .record_translation_failure(queue[0].id)
                .await
                .expect("failure");
        }
        repository
            .set_translated_title(queue[1].id, "中间")
            .await
            .expect("translated");

        let remaining = repository.list_untranslated_entries(10).await.expect("queue");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].title, "Newest");
    }

    #[tokio::test]
    async fn llm_cache_is_keyed_by_entry_task_and_fingerprint() {
        let repository = repository().await;
        let source = repository
            .upsert_source(&make_source("S", "https://s.example.com/feed.xml"))
            .await
            .expect("source");
        repository
            .upsert_entries(source.id, &[make_entry("1", "Title", None)])
            .await
            .expect("entries");
        let entry_id = repository
            .list_entries(None, None, false, 1)
            .await
            .expect("list")[0]
            .id;

        repository
            .set_llm_cache(entry_id, "summarize", "fp-1", "live_page", "model-a", "short summary")
            .await
            .expect("set");

        assert_eq!(
            repository
                .get_llm_cache(entry_id, "summarize", "fp-1")
                .await
                .expect("get")
                .as_deref(),
            Some("short summary")
        );
        assert_eq!(
            repository
                .get_llm_cache(entry_id, "summarize", "fp-2")
                .await
                .expect("get"),
            None
        );
        assert_eq!(
            repository
                .get_llm_cache(entry_id, "translate-title", "fp-1")
                .await
                .expect("get"),
            None
        );
        assert_eq!(
            repository
                .find_llm_cache_by_origin(entry_id, "summarize", "live_page", "model-a")
                .await
                .expect("find")
                .as_deref(),
            Some("short summary")
        );
        assert_eq!(
            repository
                .find_llm_cache_by_origin(entry_id, "summarize", "feed_content", "model-a")
                .await
                .expect("find"),
            None
        );
        assert_eq!(
            repository
                .find_llm_cache_by_origin(entry_id, "summarize", "live_page", "model-b")
                .await
                .expect("find"),
            None
        );
    }

    #[tokio::test]
    async fn settings_round_trip_through_a_file_database() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("rssr.db");
        let url = format!("sqlite://{}?mode=rwc", path.to_string_lossy());

        {
            let repository = SourceRepository::connect(&url).await.expect("connect");
            repository.set_setting("k", "v1").await.expect("set");
            repository.set_setting("k", "v2").await.expect("overwrite");
        }
        let reopened = SourceRepository::connect(&url).await.expect("reconnect");

        assert_eq!(
            reopened.get_setting("k").await.expect("get").as_deref(),
            Some("v2")
        );
        assert_eq!(reopened.get_setting("missing").await.expect("get"), None);
    }
}
