//! Request/response operations exposed to a UI or the CLI.
//!
//! Every operation takes one JSON object and returns JSON; failures come back
//! as [`CommandError`], which serializes to `{ "kind", "message" }`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AppConfig;
use crate::core::error::{CommandError, ValidationError};
use crate::core::importer::{ImportCandidate, ImportRequest};
use crate::core::llm::config::{
    get_saved_or_env_llm_config, resolve_llm_config, save_llm_config, LlmConfig,
};
use crate::core::normalize::canonicalize;
use crate::core::storage::models::{EntryRecord, NewSource, SourceRecord};
use crate::core::storage::repository::{SourceRepository, StorageError};
use crate::core::sync::settings::{load_sync_settings, save_sync_settings, SyncSettings};
use crate::core::sync::status::{SyncBatchResult, SyncRuntimeStatus};
use crate::core::sync::worker::SyncSourceResult;
use crate::core::AppServices;

const DEFAULT_ENTRY_LIMIT: i64 = 300;
const MAX_ENTRY_LIMIT: i64 = 1000;

pub const COMMANDS: [&str; 19] = [
    "app_health",
    "list_sources",
    "upsert_source",
    "delete_source",
    "set_sources_active",
    "preview_import",
    "import_sources",
    "list_entries",
    "mark_entry_read",
    "sync_source",
    "sync_active_sources",
    "get_sync_runtime_status",
    "get_sync_settings",
    "save_sync_settings",
    "get_llm_config",
    "save_llm_config",
    "test_llm_connection",
    "summarize_entry",
    "translate_entry",
];

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("could not build http client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertSourceRequest {
    pub title: String,
    pub site_url: Option<String>,
    pub feed_url: String,
    pub category: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListEntriesRequest {
    pub source_id: Option<i64>,
    pub search: Option<String>,
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct IdRequest {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct SetActiveRequest {
    source_ids: Vec<i64>,
    is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MarkReadRequest {
    entry_id: i64,
    is_read: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceIdRequest {
    source_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct EntryIdRequest {
    entry_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslateRequest {
    pub entry_id: i64,
    pub target_language: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SyncActiveRequest {
    #[serde(default)]
    wait: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceDto {
    pub id: i64,
    pub title: String,
    pub site_url: Option<String>,
    pub feed_url: String,
    pub category: Option<String>,
    pub is_active: bool,
    pub failure_count: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_synced_at: Option<String>,
    pub last_attempt_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<SourceRecord> for SourceDto {
    fn from(source: SourceRecord) -> Self {
        Self {
            id: source.id,
            title: source.title,
            site_url: source.site_url,
            feed_url: source.feed_url,
            category: source.category,
            is_active: source.is_active == 1,
            failure_count: source.failure_count,
            etag: source.etag,
            last_modified: source.last_modified,
            last_synced_at: source.last_synced_at,
            last_attempt_at: source.last_attempt_at,
            created_at: source.created_at,
            updated_at: source.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryDto {
    pub id: i64,
    pub source_id: i64,
    pub source_title: String,
    pub guid: Option<String>,
    pub link: String,
    pub title: String,
    pub translated_title: Option<String>,
    pub summary: Option<String>,
    pub ai_summary: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub created_at: String,
}

impl From<EntryRecord> for EntryDto {
    fn from(entry: EntryRecord) -> Self {
        Self {
            id: entry.id,
            source_id: entry.source_id,
            source_title: entry.source_title,
            guid: entry.guid,
            link: entry.link,
            title: entry.title,
            translated_title: entry.translated_title,
            summary: entry.summary,
            ai_summary: entry.ai_summary,
            content: entry.content,
            published_at: entry.published_at,
            is_read: entry.is_read == 1,
            is_starred: entry.is_starred == 1,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportPreviewResponse {
    pub new_count: usize,
    pub duplicate_count: usize,
    pub new_sources: Vec<ImportCandidate>,
    pub duplicate_sources: Vec<ImportCandidate>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportExecuteResponse {
    pub imported_count: usize,
    pub duplicate_count: usize,
    pub warnings: Vec<String>,
}

/// Result of `sync_active_sources`: the final batch when waited for, the
/// live status otherwise.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SyncActiveResponse {
    Finished(SyncBatchResult),
    Started(SyncRuntimeStatus),
}

#[derive(Clone)]
pub struct App {
    services: AppServices,
}

impl App {
    pub fn new(services: AppServices) -> Self {
        Self { services }
    }

    /// Opens storage and wires the services from process configuration.
    pub async fn connect(config: &AppConfig) -> Result<Self, StartupError> {
        let repository = SourceRepository::connect(&config.database_url).await?;
        let services = AppServices::new(repository, config.service_options())?;
        Ok(Self::new(services))
    }

    pub fn services(&self) -> &AppServices {
        &self.services
    }

    fn repository(&self) -> &SourceRepository {
        self.services.repository()
    }

    /// Dispatches a command by name. `Null` arguments are treated as `{}`.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, CommandError> {
        let args = match args {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        tracing::debug!(command = name, "invoke");
        match name {
            "app_health" => to_json(self.app_health().await),
            "list_sources" => to_json(self.list_sources().await?),
            "upsert_source" => to_json(self.upsert_source(parse_args(name, args)?).await?),
            "delete_source" => {
                let request: IdRequest = parse_args(name, args)?;
                to_json(self.delete_source(request.id).await?)
            }
            "set_sources_active" => {
                let request: SetActiveRequest = parse_args(name, args)?;
                to_json(
                    self.set_sources_active(&request.source_ids, request.is_active)
                        .await?,
                )
            }
            "preview_import" => to_json(self.preview_import(parse_args(name, args)?).await?),
            "import_sources" => to_json(self.import_sources(parse_args(name, args)?).await?),
            "list_entries" => to_json(self.list_entries(parse_args(name, args)?).await?),
            "mark_entry_read" => {
                let request: MarkReadRequest = parse_args(name, args)?;
                to_json(self.mark_entry_read(request.entry_id, request.is_read).await?)
            }
            "sync_source" => {
                let request: SourceIdRequest = parse_args(name, args)?;
                to_json(self.sync_source(request.source_id).await?)
            }
            "sync_active_sources" => {
                let request: SyncActiveRequest = parse_args(name, args)?;
                to_json(self.sync_active_sources(request.wait).await?)
            }
            "get_sync_runtime_status" => to_json(self.get_sync_runtime_status().await),
            "get_sync_settings" => to_json(self.get_sync_settings().await?),
            "save_sync_settings" => {
                to_json(self.save_sync_settings(parse_args(name, args)?).await?)
            }
            "get_llm_config" => to_json(self.get_llm_config().await?),
            "save_llm_config" => to_json(self.save_llm_config(parse_args(name, args)?).await?),
            "test_llm_connection" => {
                let config = if args.as_object().is_some_and(|fields| fields.is_empty()) {
                    None
                } else {
                    Some(parse_args(name, args)?)
                };
                to_json(self.test_llm_connection(config).await?)
            }
            "summarize_entry" => {
                let request: EntryIdRequest = parse_args(name, args)?;
                to_json(self.summarize_entry(request.entry_id).await?)
            }
            "translate_entry" => to_json(self.translate_entry(parse_args(name, args)?).await?),
            unknown => Err(CommandError::UnknownCommand(unknown.to_string())),
        }
    }

    pub async fn app_health(&self) -> BTreeMap<String, String> {
        self.services.health_report().await
    }

    pub async fn list_sources(&self) -> Result<Vec<SourceDto>, CommandError> {
        let rows = self.repository().list_sources().await?;
        Ok(rows.into_iter().map(SourceDto::from).collect())
    }

    pub async fn upsert_source(
        &self,
        request: UpsertSourceRequest,
    ) -> Result<SourceDto, CommandError> {
        let feed_url = canonicalize(&request.feed_url);
        if !feed_url.is_http() {
            return Err(ValidationError::new("feed_url", "must be an http(s) url").into());
        }
        let title = match request.title.trim() {
            "" => feed_url.to_string(),
            title => title.to_string(),
        };
        let source = NewSource {
            title,
            site_url: request.site_url,
            feed_url: feed_url.into_string(),
            category: request.category,
            is_active: request.is_active,
        };
        let row = self.repository().upsert_source(&source).await?;
        Ok(row.into())
    }

    pub async fn delete_source(&self, id: i64) -> Result<u64, CommandError> {
        Ok(self.repository().delete_source(id).await?)
    }

    pub async fn set_sources_active(
        &self,
        source_ids: &[i64],
        is_active: bool,
    ) -> Result<u64, CommandError> {
        Ok(self
            .repository()
            .set_sources_active(source_ids, is_active)
            .await?)
    }

    pub async fn preview_import(
        &self,
        request: ImportRequest,
    ) -> Result<ImportPreviewResponse, CommandError> {
        let preview = self.services.importer().preview(&request).await?;
        Ok(ImportPreviewResponse {
            new_count: preview.new_sources.len(),
            duplicate_count: preview.duplicate_sources.len(),
            new_sources: preview.new_sources,
            duplicate_sources: preview.duplicate_sources,
            warnings: preview.warnings,
        })
    }

    pub async fn import_sources(
        &self,
        request: ImportRequest,
    ) -> Result<ImportExecuteResponse, CommandError> {
        let report = self.services.importer().execute(&request).await?;
        Ok(ImportExecuteResponse {
            imported_count: report.imported_count,
            duplicate_count: report.duplicate_count,
            warnings: report.warnings,
        })
    }

    pub async fn list_entries(
        &self,
        request: ListEntriesRequest,
    ) -> Result<Vec<EntryDto>, CommandError> {
        let limit = request
            .limit
            .unwrap_or(DEFAULT_ENTRY_LIMIT)
            .clamp(1, MAX_ENTRY_LIMIT);
        let rows = self
            .repository()
            .list_entries(
                request.source_id,
                request.search.as_deref(),
                request.unread_only,
                limit,
            )
            .await?;
        Ok(rows.into_iter().map(EntryDto::from).collect())
    }

    pub async fn mark_entry_read(&self, entry_id: i64, is_read: bool) -> Result<u64, CommandError> {
        Ok(self.repository().mark_entry_read(entry_id, is_read).await?)
    }

    pub async fn sync_source(&self, source_id: i64) -> Result<SyncSourceResult, CommandError> {
        Ok(self.services.scheduler().sync_one(source_id).await?)
    }

    pub async fn sync_active_sources(&self, wait: bool) -> Result<SyncActiveResponse, CommandError> {
        let scheduler = self.services.scheduler();
        if wait {
            return Ok(SyncActiveResponse::Finished(scheduler.run_batch().await?));
        }
        Ok(SyncActiveResponse::Started(scheduler.spawn_batch().await))
    }

    pub async fn get_sync_runtime_status(&self) -> SyncRuntimeStatus {
        self.services.scheduler().status().snapshot().await
    }

    pub async fn get_sync_settings(&self) -> Result<SyncSettings, CommandError> {
        Ok(load_sync_settings(self.repository()).await?)
    }

    pub async fn save_sync_settings(
        &self,
        settings: SyncSettings,
    ) -> Result<SyncSettings, CommandError> {
        Ok(save_sync_settings(self.repository(), settings).await?)
    }

    pub async fn get_llm_config(&self) -> Result<Option<LlmConfig>, CommandError> {
        Ok(get_saved_or_env_llm_config(self.repository()).await?)
    }

    pub async fn save_llm_config(&self, config: LlmConfig) -> Result<LlmConfig, CommandError> {
        Ok(save_llm_config(self.repository(), config).await?)
    }

    /// Uses the given config, or the saved one when none is passed.
    pub async fn test_llm_connection(
        &self,
        config: Option<LlmConfig>,
    ) -> Result<String, CommandError> {
        let resolved = resolve_llm_config(config, self.repository()).await?;
        Ok(self
            .services
            .pipeline()
            .llm()
            .test_connection(&resolved)
            .await?)
    }

    pub async fn summarize_entry(&self, entry_id: i64) -> Result<String, CommandError> {
        Ok(self.services.pipeline().summarize(entry_id).await?)
    }

    pub async fn translate_entry(&self, request: TranslateRequest) -> Result<String, CommandError> {
        if request.target_language.trim().is_empty() {
            return Err(ValidationError::new("target_language", "must not be empty").into());
        }
        Ok(self
            .services
            .pipeline()
            .translate_entry(request.entry_id, &request.target_language)
            .await?)
    }
}

fn parse_args<T: DeserializeOwned>(command: &str, args: Value) -> Result<T, CommandError> {
    serde_json::from_value(args)
        .map_err(|error| CommandError::Validation(format!("invalid arguments for {command}: {error}")))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|error| CommandError::InvalidResponse(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceOptions;
    use serde_json::json;

    async fn app() -> App {
        let repository = SourceRepository::connect("sqlite::memory:")
            .await
            .expect("connect");
        App::new(AppServices::new(repository, ServiceOptions::default()).expect("services"))
    }

    fn error_kind(error: CommandError) -> Value {
        serde_json::to_value(error).expect("serialize")["kind"].clone()
    }

    #[tokio::test]
    async fn unknown_commands_are_rejected() {
        let error = app()
            .await
            .invoke("drop_tables", Value::Null)
            .await
            .expect_err("unknown");
        assert_eq!(error_kind(error), "unknown_command");
    }

    #[tokio::test]
    async fn upsert_list_and_toggle_sources() {
        let app = app().await;
        let created = app
            .invoke(
                "upsert_source",
                json!({
                    "title": "",
                    "feed_url": "Example.com/feed.xml?utm_source=x",
                    "is_active": true
                }),
            )
            .await
            .expect("upsert");
        let id = created["id"].as_i64().expect("id");

        assert_eq!(created["feed_url"], "https://example.com/feed.xml");
        assert_eq!(created["title"], "https://example.com/feed.xml");

        let toggled = app
            .invoke("set_sources_active", json!({ "source_ids": [id], "is_active": false }))
            .await
            .expect("toggle");
        let listed = app.invoke("list_sources", json!({})).await.expect("list");

        assert_eq!(toggled, json!(1));
        assert_eq!(listed[0]["is_active"], false);
        assert_eq!(
            app.invoke("delete_source", json!({ "id": id })).await.expect("delete"),
            json!(1)
        );
    }

    #[tokio::test]
    async fn non_http_feed_urls_are_validation_errors() {
        let error = app()
            .await
            .invoke(
                "upsert_source",
                json!({ "title": "x", "feed_url": "ftp://example.com/feed", "is_active": true }),
            )
            .await
            .expect_err("ftp");
        assert_eq!(error_kind(error), "validation_error");
    }

    #[tokio::test]
    async fn malformed_arguments_are_validation_errors() {
        let error = app()
            .await
            .invoke("delete_source", json!({ "id": "seven" }))
            .await
            .expect_err("bad id");
        assert_eq!(error_kind(error), "validation_error");
    }

    #[tokio::test]
    async fn import_preview_and_execute_through_commands() {
        let app = app().await;
        let payload = json!({
            "format": "urls",
            "content": "https://a.example.com/rss\nhttps://b.example.com/rss\nhttps://a.example.com/rss/"
        });

        let preview = app
            .invoke("preview_import", payload.clone())
            .await
            .expect("preview");
        let imported = app.invoke("import_sources", payload).await.expect("import");

        assert_eq!(preview["new_count"], 2);
        assert_eq!(preview["duplicate_count"], 1);
        assert_eq!(imported["imported_count"], 2);
    }

    #[tokio::test]
    async fn broken_opml_is_a_parse_error() {
        let error = app()
            .await
            .invoke("import_sources", json!({ "format": "opml", "content": "<opml><body>" }))
            .await
            .expect_err("broken xml");
        assert_eq!(error_kind(error), "parse_error");
    }

    #[tokio::test]
    async fn sync_settings_are_validated_and_normalized() {
        let app = app().await;
        let saved = app
            .invoke(
                "save_sync_settings",
                json!({ "interval_secs": 10, "max_concurrency": 100, "batch_limit": 50, "timeout_secs": 20, "retry_count": 2 }),
            )
            .await
            .expect("save");
        let error = app
            .invoke("save_sync_settings", json!({ "max_concurrency": -1 }))
            .await
            .expect_err("negative");

        assert_eq!(saved["interval_secs"], 60);
        assert_eq!(saved["max_concurrency"], 32);
        assert_eq!(
            app.invoke("get_sync_settings", Value::Null).await.expect("get"),
            saved
        );
        assert_eq!(error_kind(error), "validation_error");
    }

    #[tokio::test]
    async fn missing_entities_are_not_found() {
        let app = app().await;
        let sync = app
            .invoke("sync_source", json!({ "source_id": 77 }))
            .await
            .expect_err("missing source");
        assert_eq!(error_kind(sync), "not_found");
        assert_eq!(
            app.invoke("mark_entry_read", json!({ "entry_id": 77, "is_read": true }))
                .await
                .expect("mark"),
            json!(0)
        );
    }

    #[tokio::test]
    async fn sync_active_sources_acknowledges_or_waits() {
        let app = app().await;
        let finished = app
            .invoke("sync_active_sources", json!({ "wait": true }))
            .await
            .expect("wait");
        assert_eq!(
            finished,
            json!({ "synced_sources": 0, "failed_sources": 0, "total_upserted_entries": 0 })
        );

        let ack = app
            .invoke("sync_active_sources", Value::Null)
            .await
            .expect("ack");
        assert!(ack.get("running").is_some());
        let status = app
            .invoke("get_sync_runtime_status", Value::Null)
            .await
            .expect("status");
        assert!(status.get("completed_sources").is_some());
    }

    #[tokio::test]
    async fn llm_config_round_trip_and_validation() {
        let app = app().await;
        let saved = app
            .invoke(
                "save_llm_config",
                json!({ "base_url": "https://api.example.com/v1", "api_key": "k", "model": "m" }),
            )
            .await
            .expect("save");
        let error = app
            .invoke(
                "save_llm_config",
                json!({ "base_url": "", "api_key": "k", "model": "m", "timeout_secs": 30 }),
            )
            .await
            .expect_err("empty base url");

        assert_eq!(saved["timeout_secs"], 30);
        assert_eq!(
            app.invoke("get_llm_config", Value::Null).await.expect("get"),
            saved
        );
        assert_eq!(error_kind(error), "validation_error");
    }

    #[tokio::test]
    async fn translate_requires_a_language() {
        let error = app()
            .await
            .invoke("translate_entry", json!({ "entry_id": 1, "target_language": " " }))
            .await
            .expect_err("empty language");
        assert_eq!(error_kind(error), "validation_error");
    }

    #[test]
    fn command_list_has_no_duplicates() {
        let mut names = COMMANDS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), COMMANDS.len());
    }
}
