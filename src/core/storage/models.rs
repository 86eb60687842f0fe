use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::core::feed::fetcher::Validators;
use crate::core::feed::types::ParsedEntry;
use crate::core::normalize::dedup_key;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub title: String,
    pub site_url: Option<String>,
    pub feed_url: String,
    pub category: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SourceRecord {
    pub id: i64,
    pub title: String,
    pub site_url: Option<String>,
    pub feed_url: String,
    pub category: Option<String>,
    pub is_active: i64,
    pub failure_count: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_synced_at: Option<String>,
    pub last_attempt_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SourceRecord {
    pub fn validators(&self) -> Validators {
        Validators::new(self.etag.clone(), self.last_modified.clone())
    }
}

/// An entry ready to be merged into storage, identity already computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub dedup_key: String,
    pub guid: Option<String>,
    pub link: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<String>,
}

impl From<ParsedEntry> for NewEntry {
    fn from(entry: ParsedEntry) -> Self {
        Self {
            dedup_key: dedup_key(&entry),
            published_at: entry
                .published_at
                .map(|timestamp| timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
            guid: entry.guid,
            link: entry.link,
            title: entry.title,
            summary: entry.summary,
            content: entry.content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntryRecord {
    pub id: i64,
    pub source_id: i64,
    pub source_title: String,
    pub dedup_key: String,
    pub guid: Option<String>,
    pub link: String,
    pub title: String,
    pub translated_title: Option<String>,
    pub summary: Option<String>,
    pub ai_summary: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<String>,
    pub is_read: i64,
    pub is_starred: i64,
    pub created_at: String,
}
