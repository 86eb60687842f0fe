use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Serialize;

use crate::core::storage::models::EntryRecord;

const TEXT_WIDTH: usize = 120;
const MIN_ARTICLE_CHARS: usize = 200;
const MAIN_CONTENT_SELECTORS: [&str; 5] = [
    "article",
    "main",
    "[role=main]",
    "#content",
    "body",
];

/// Where the text handed to the model came from. Part of the cache
/// fingerprint, so live and fallback text never share a cache row.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentOrigin {
    LivePage,
    FeedContent,
}

impl ContentOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LivePage => "live_page",
            Self::FeedContent => "feed_content",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub origin: ContentOrigin,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("entry has no fetchable link")]
    NoLink,
    #[error("article request failed: {0}")]
    Network(String),
    #[error("article request returned status {0}")]
    Http(u16),
    #[error("article request timed out")]
    Timeout,
    #[error("no usable text found")]
    Empty,
}

impl From<reqwest::Error> for ExtractError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(error.to_string())
        }
    }
}

#[async_trait]
pub trait ContentExtractor: Send + Sync {
    fn origin(&self) -> ContentOrigin;

    /// Extractors that go to the network are skipped when probing the cache.
    fn requires_network(&self) -> bool {
        false
    }

    async fn extract(&self, entry: &EntryRecord) -> Result<String, ExtractError>;
}

/// Downloads the article and keeps the main content block as plain text.
#[derive(Debug, Clone)]
pub struct LivePageExtractor {
    client: reqwest::Client,
    timeout: Duration,
}

impl LivePageExtractor {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ContentExtractor for LivePageExtractor {
    fn origin(&self) -> ContentOrigin {
        ContentOrigin::LivePage
    }

    fn requires_network(&self) -> bool {
        true
    }

    async fn extract(&self, entry: &EntryRecord) -> Result<String, ExtractError> {
        let link = entry.link.trim();
        if !(link.starts_with("http://") || link.starts_with("https://")) {
            return Err(ExtractError::NoLink);
        }
        let response = self.client.get(link).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Http(status.as_u16()));
        }
        let html = response.text().await?;
        extract_main_text(&html).ok_or(ExtractError::Empty)
    }
}

/// Uses what the feed itself shipped: full content first, then the summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedContentExtractor;

#[async_trait]
impl ContentExtractor for FeedContentExtractor {
    fn origin(&self) -> ContentOrigin {
        ContentOrigin::FeedContent
    }

    async fn extract(&self, entry: &EntryRecord) -> Result<String, ExtractError> {
        [entry.content.as_deref(), entry.summary.as_deref()]
            .into_iter()
            .flatten()
            .map(html_to_text)
            .find(|text| !text.is_empty())
            .ok_or(ExtractError::Empty)
    }
}

/// Tries each extractor in order and returns the first success.
pub async fn extract_with_fallback(
    extractors: &[Box<dyn ContentExtractor>],
    entry: &EntryRecord,
) -> Option<ExtractedContent> {
    for extractor in extractors {
        match extractor.extract(entry).await {
            Ok(text) => {
                return Some(ExtractedContent {
                    origin: extractor.origin(),
                    text,
                })
            }
            Err(error) => tracing::debug!(
                entry_id = entry.id,
                origin = extractor.origin().as_str(),
                %error,
                "content extraction failed"
            ),
        }
    }
    None
}

/// Picks the first main-content container with enough text.
pub fn extract_main_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    for raw_selector in MAIN_CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(raw_selector) else {
            continue;
        };
        for element in document.select(&selector) {
            let text = html_to_text(&element.html());
            if text.chars().count() >= MIN_ARTICLE_CHARS {
                return Some(text);
            }
        }
    }
    None
}

/// Renders HTML (or plain text) as trimmed plain text with blank-line runs collapsed.
pub fn html_to_text(html: &str) -> String {
    let rendered = html2text::config::plain()
        .string_from_read(html.as_bytes(), TEXT_WIDTH)
        .unwrap_or_else(|_| html.to_string());
    let mut out = String::with_capacity(rendered.len());
    let mut blank_run = 0_usize;
    for line in rendered.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
