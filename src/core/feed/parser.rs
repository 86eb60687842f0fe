use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use feed_rs::model::{Entry, FeedType};
use serde::Deserialize;

use super::types::{FeedFormat, ParsedEntry, ParsedFeed};
use crate::core::error::ParseErrorKind;

const UNTITLED_FEED: &str = "Untitled Feed";
const UNTITLED_ENTRY: &str = "Untitled Entry";

#[derive(Debug, thiserror::Error)]
pub enum FeedParseError {
    #[error("feed payload is empty")]
    EmptyPayload,
    #[error("unsupported feed format: {0}")]
    UnsupportedFormat(String),
    #[error("xml feed parse error: {0}")]
    Xml(String),
    #[error("json feed parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeedParseError {
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            Self::EmptyPayload | Self::UnsupportedFormat(_) => ParseErrorKind::UnsupportedFormat,
            Self::Xml(_) => ParseErrorKind::MalformedXml,
            Self::Json(_) => ParseErrorKind::MalformedJson,
        }
    }
}

impl From<feed_rs::parser::ParseFeedError> for FeedParseError {
    fn from(error: feed_rs::parser::ParseFeedError) -> Self {
        match error {
            feed_rs::parser::ParseFeedError::ParseError(kind) => {
                Self::UnsupportedFormat(format!("{kind:?}"))
            }
            other => Self::Xml(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct JsonFeed {
    version: Option<String>,
    title: Option<String>,
    home_page_url: Option<String>,
    feed_url: Option<String>,
    items: Option<Vec<JsonFeedItem>>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonFeedItem {
    id: Option<serde_json::Value>,
    title: Option<String>,
    url: Option<String>,
    summary: Option<String>,
    content_text: Option<String>,
    content_html: Option<String>,
    date_published: Option<serde_json::Value>,
    date_modified: Option<serde_json::Value>,
}

/// Parses a feed payload. `content_type` is the declared response type, if any;
/// the payload itself is sniffed when the declaration is missing or generic.
pub fn parse_feed_bytes(raw: &[u8], content_type: Option<&str>) -> Result<ParsedFeed, FeedParseError> {
    let trimmed = trim_leading_noise(raw);
    if trimmed.is_empty() {
        return Err(FeedParseError::EmptyPayload);
    }
    let declared_json = content_type
        .map(|value| value.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    if trimmed[0] == b'{' || (declared_json && trimmed[0] != b'<') {
        return parse_json_feed(trimmed);
    }
    parse_xml_feed(trimmed)
}

/// Permissive timestamp parsing: RFC 3339, RFC 822/2822, Unix epoch seconds or
/// milliseconds, and a couple of naive layouts seen in the wild.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if value.bytes().all(|byte| byte.is_ascii_digit()) {
        let number: i64 = value.parse().ok()?;
        // Anything past year 5138 in seconds is assumed to be milliseconds.
        return if number > 99_999_999_999 {
            DateTime::from_timestamp_millis(number)
        } else {
            DateTime::from_timestamp(number, 0)
        };
    }
    for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, layout) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|timestamp| timestamp.and_utc())
}

fn parse_xml_feed(raw: &[u8]) -> Result<ParsedFeed, FeedParseError> {
    // feed-rs invents ids (md5 or random uuid) for items without one; leave
    // them empty so only feed-supplied guids reach the dedup key.
    let parser = feed_rs::parser::Builder::new()
        .timestamp_parser(parse_timestamp)
        .id_generator(|_links, _title, _uri| String::new())
        .build();
    let feed = parser.parse(raw)?;
    let format = match feed.feed_type {
        FeedType::Atom => FeedFormat::Atom,
        FeedType::RSS1 => FeedFormat::Rdf,
        FeedType::JSON => FeedFormat::JsonFeed,
        FeedType::RSS0 | FeedType::RSS2 => FeedFormat::Rss,
    };
    let title = feed
        .title
        .as_ref()
        .map(|text| text.content.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| UNTITLED_FEED.to_string());
    let home_page_url = feed.links.first().map(|link| link.href.clone());
    let entries = feed.entries.iter().map(entry_from_xml).collect();

    Ok(ParsedFeed {
        format,
        title,
        home_page_url,
        feed_url: None,
        entries,
    })
}

fn parse_json_feed(raw: &[u8]) -> Result<ParsedFeed, FeedParseError> {
    let feed: JsonFeed = serde_json::from_slice(raw)?;
    let is_json_feed = feed
        .version
        .as_deref()
        .map(|version| version.contains("jsonfeed.org"))
        .unwrap_or(false);
    if !is_json_feed && feed.items.is_none() {
        return Err(FeedParseError::UnsupportedFormat(
            "json document is not a JSON Feed".to_string(),
        ));
    }

    let title = feed
        .title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| UNTITLED_FEED.to_string());
    let entries = feed
        .items
        .unwrap_or_default()
        .into_iter()
        .map(|item| ParsedEntry {
            guid: item.id.as_ref().and_then(json_scalar_to_string),
            title: item
                .title
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| UNTITLED_ENTRY.to_string()),
            link: item.url.unwrap_or_default(),
            summary: item.summary,
            content: item.content_html.or(item.content_text),
            published_at: item
                .date_published
                .as_ref()
                .or(item.date_modified.as_ref())
                .and_then(json_scalar_to_string)
                .and_then(|raw| parse_timestamp(&raw)),
        })
        .collect();

    Ok(ParsedFeed {
        format: FeedFormat::JsonFeed,
        title,
        home_page_url: feed.home_page_url,
        feed_url: feed.feed_url,
        entries,
    })
}

fn json_scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn entry_from_xml(entry: &Entry) -> ParsedEntry {
    let guid = Some(entry.id.trim().to_string()).filter(|id| !id.is_empty());
    let title = entry
        .title
        .as_ref()
        .map(|text| text.content.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| UNTITLED_ENTRY.to_string());
    let link = entry
        .links
        .iter()
        .find(|link| link.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| entry.links.first())
        .map(|entry_link| entry_link.href.clone())
        .unwrap_or_default();
    let summary = entry.summary.as_ref().map(|text| text.content.clone());
    let content = entry
        .content
        .as_ref()
        .and_then(|content| content.body.clone());

    ParsedEntry {
        guid,
        title,
        link,
        summary,
        content,
        published_at: entry.published.or(entry.updated),
    }
}

/// Skips leading whitespace and a UTF-8 byte order mark.
fn trim_leading_noise(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw);
    let mut index = 0;
    while index < raw.len() && raw[index].is_ascii_whitespace() {
        index += 1;
    }
    &raw[index..]
}
