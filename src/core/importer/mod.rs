use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::normalize::{canonicalize, CanonicalUrl};
use crate::core::storage::models::NewSource;
use crate::core::storage::repository::{SourceRepository, StorageError};

/// A feed found in an import payload. `feed_url` holds the canonical form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportCandidate {
    pub title: String,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub duplicate: bool,
}

impl ImportCandidate {
    fn new(title: Option<&str>, feed_url: &str) -> Self {
        let title = title
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(feed_url)
            .to_string();
        Self {
            title,
            feed_url: feed_url.to_string(),
            site_url: None,
            category: None,
            duplicate: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    Opml,
    UrlList,
    Json,
}

impl FromStr for ImportFormat {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "opml" | "xml" => Ok(Self::Opml),
            "url_list" | "urls" | "txt" => Ok(Self::UrlList),
            "json" | "json_list" => Ok(Self::Json),
            unsupported => Err(ImportError::UnsupportedFormat(unsupported.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportRequest {
    pub format: String,
    pub content: String,
    pub default_category: Option<String>,
    pub is_active: Option<bool>,
}

/// Candidates parsed out of a payload plus the nodes that were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedImport {
    pub candidates: Vec<ImportCandidate>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportPreview {
    pub new_sources: Vec<ImportCandidate>,
    pub duplicate_sources: Vec<ImportCandidate>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub imported_count: usize,
    pub duplicate_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("invalid OPML content: {0}")]
    Opml(String),
    #[error("invalid JSON import format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported import format: {0}")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Two-phase import against the stored sources.
#[derive(Debug, Clone)]
pub struct Importer {
    repository: SourceRepository,
}

impl Importer {
    pub fn new(repository: SourceRepository) -> Self {
        Self { repository }
    }

    pub fn name(&self) -> &'static str {
        "importer"
    }

    pub fn status(&self) -> &'static str {
        "ready"
    }

    pub async fn preview(&self, request: &ImportRequest) -> Result<ImportPreview, ImportError> {
        let parsed = parse_import(request)?;
        let existing = self.existing_feed_urls().await?;
        Ok(build_import_preview(parsed, &existing))
    }

    /// Inserts every non-duplicate candidate. Re-running the same payload
    /// imports nothing and reports every candidate as a duplicate.
    pub async fn execute(&self, request: &ImportRequest) -> Result<ImportReport, ImportError> {
        let preview = self.preview(request).await?;
        let is_active = request.is_active.unwrap_or(true);
        let default_category = request
            .default_category
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let sources: Vec<NewSource> = preview
            .new_sources
            .iter()
            .map(|candidate| NewSource {
                title: candidate.title.clone(),
                site_url: candidate.site_url.clone(),
                feed_url: candidate.feed_url.clone(),
                category: candidate
                    .category
                    .clone()
                    .or_else(|| default_category.map(ToString::to_string)),
                is_active,
            })
            .collect();

        let imported_count = self.repository.insert_new_sources(&sources).await?;
        // Rows that appeared between preview and insert count as duplicates.
        let raced = sources.len() - imported_count;
        let report = ImportReport {
            imported_count,
            duplicate_count: preview.duplicate_sources.len() + raced,
            warnings: preview.warnings,
        };
        tracing::info!(
            imported = report.imported_count,
            duplicates = report.duplicate_count,
            warnings = report.warnings.len(),
            "import finished"
        );
        Ok(report)
    }

    async fn existing_feed_urls(&self) -> Result<HashSet<CanonicalUrl>, StorageError> {
        let rows = self.repository.list_sources().await?;
        Ok(rows
            .into_iter()
            .map(|row| canonicalize(&row.feed_url))
            .collect())
    }
}

pub fn parse_import(request: &ImportRequest) -> Result<ParsedImport, ImportError> {
    match request.format.parse::<ImportFormat>()? {
        ImportFormat::Opml => parse_opml(&request.content),
        ImportFormat::UrlList => Ok(parse_url_list(&request.content)),
        ImportFormat::Json => parse_json_sources(&request.content),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum JsonImportItem {
    Url(String),
    Object {
        #[serde(alias = "feedUrl", alias = "xmlUrl", alias = "url")]
        feed_url: String,
        title: Option<String>,
        #[serde(alias = "siteUrl", alias = "htmlUrl")]
        site_url: Option<String>,
        category: Option<String>,
    },
}

/// Walks every `outline` element. Groups (outlines without `xmlUrl`) are
/// flattened into a `Parent / Child` category label on their leaves.
pub fn parse_opml(opml_content: &str) -> Result<ParsedImport, ImportError> {
    let doc = roxmltree::Document::parse(opml_content)
        .map_err(|error| ImportError::Opml(error.to_string()))?;
    let mut parsed = ParsedImport::default();

    for node in doc.descendants().filter(|node| node.has_tag_name("outline")) {
        let Some(raw_url) = node.attribute("xmlUrl") else {
            if !node.children().any(|child| child.has_tag_name("outline")) {
                parsed.warnings.push(format!(
                    "skipped outline {:?}: no xmlUrl",
                    outline_label(node).unwrap_or("<unnamed>")
                ));
            }
            continue;
        };

        let feed_url = canonicalize(raw_url);
        if !feed_url.is_http() {
            parsed.warnings.push(format!(
                "skipped outline {:?}: invalid feed url {:?}",
                outline_label(node).unwrap_or("<unnamed>"),
                raw_url.trim()
            ));
            continue;
        }

        let mut candidate = ImportCandidate::new(outline_label(node), feed_url.as_str());
        candidate.site_url = node
            .attribute("htmlUrl")
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);
        candidate.category = node
            .attribute("category")
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .or_else(|| infer_opml_category(node));
        parsed.candidates.push(candidate);
    }

    Ok(parsed)
}

pub fn parse_url_list(input: &str) -> ParsedImport {
    let mut parsed = ParsedImport::default();
    for line in input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
    {
        let feed_url = canonicalize(line);
        if !(line.starts_with("http://") || line.starts_with("https://")) || !feed_url.is_http() {
            parsed.warnings.push(format!("skipped line {line:?}: not an http(s) url"));
            continue;
        }
        parsed
            .candidates
            .push(ImportCandidate::new(None, feed_url.as_str()));
    }
    parsed
}

pub fn parse_json_sources(input: &str) -> Result<ParsedImport, ImportError> {
    let items: Vec<serde_json::Value> = serde_json::from_str(input)?;
    let mut parsed = ParsedImport::default();

    for (index, value) in items.into_iter().enumerate() {
        let item = match serde_json::from_value::<JsonImportItem>(value) {
            Ok(item) => item,
            Err(_) => {
                parsed
                    .warnings
                    .push(format!("skipped item {index}: expected a url or an object with feedUrl"));
                continue;
            }
        };
        let (raw_url, title, site_url, category) = match item {
            JsonImportItem::Url(feed_url) => (feed_url, None, None, None),
            JsonImportItem::Object {
                feed_url,
                title,
                site_url,
                category,
            } => (feed_url, title, site_url, category),
        };
        let feed_url = canonicalize(&raw_url);
        if !feed_url.is_http() {
            parsed
                .warnings
                .push(format!("skipped item {index}: invalid feed url {raw_url:?}"));
            continue;
        }
        let mut candidate = ImportCandidate::new(title.as_deref(), feed_url.as_str());
        candidate.site_url = site_url;
        candidate.category = category;
        parsed.candidates.push(candidate);
    }

    Ok(parsed)
}

/// Splits candidates into new and duplicate by canonical feed URL. A repeat
/// inside the same payload is a duplicate of its first occurrence; titles are
/// never compared.
pub fn build_import_preview(
    parsed: ParsedImport,
    existing_feed_urls: &HashSet<CanonicalUrl>,
) -> ImportPreview {
    let mut seen = HashSet::<CanonicalUrl>::new();
    let mut duplicate_sources = Vec::new();
    let mut new_sources = Vec::new();

    for mut candidate in parsed.candidates {
        let normalized = canonicalize(&candidate.feed_url);
        if normalized.is_empty() {
            continue;
        }

        if existing_feed_urls.contains(&normalized) || !seen.insert(normalized) {
            candidate.duplicate = true;
            duplicate_sources.push(candidate);
            continue;
        }

        new_sources.push(candidate);
    }

    ImportPreview {
        new_sources,
        duplicate_sources,
        warnings: parsed.warnings,
    }
}

fn outline_label<'a>(node: roxmltree::Node<'a, '_>) -> Option<&'a str> {
    node.attribute("title")
        .or_else(|| node.attribute("text"))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn infer_opml_category(node: roxmltree::Node<'_, '_>) -> Option<String> {
    let mut groups: Vec<&str> = node
        .ancestors()
        .skip(1)
        .filter(|ancestor| ancestor.has_tag_name("outline"))
        .filter(|ancestor| ancestor.attribute("xmlUrl").is_none())
        .filter_map(outline_label)
        .collect();
    if groups.is_empty() {
        return None;
    }
    groups.reverse();
    Some(groups.join(" / "))
}
