//! Canonical URLs and stable identity keys for sources and entries.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::core::feed::types::ParsedEntry;

/// Query parameters that only carry campaign or click tracking state.
const TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "yclid", "msclkid", "mc_cid", "mc_eid", "igshid", "ref_src", "_hsenc",
    "_hsmi", "spm",
];

/// A feed or article URL after canonicalization.
///
/// Two inputs that differ only by scheme/host case, a default port, a
/// fragment, tracking parameters or a trailing slash map to the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the canonical form is an absolute http(s) URL.
    pub fn is_http(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn canonicalize(input: &str) -> CanonicalUrl {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return CanonicalUrl(String::new());
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let Ok(mut url) = Url::parse(&candidate) else {
        return CanonicalUrl(trimmed.trim_end_matches('/').to_lowercase());
    };

    url.set_fragment(None);
    strip_tracking_params(&mut url);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let collapsed = path.trim_end_matches('/');
        url.set_path(if collapsed.is_empty() { "/" } else { collapsed });
    }

    let mut serialized = url.to_string();
    if url.path() == "/" && url.query().is_none() && serialized.ends_with('/') {
        serialized.pop();
    }
    CanonicalUrl(serialized)
}

fn strip_tracking_params(url: &mut Url) {
    if url.query().is_none() {
        return;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
        return;
    }
    url.query_pairs_mut().clear().extend_pairs(kept);
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Identity of an entry within its source.
///
/// Priority: feed-supplied guid, then the canonical link, then a hash of the
/// title and the publication day.
pub fn dedup_key(entry: &ParsedEntry) -> String {
    if let Some(guid) = entry
        .guid
        .as_deref()
        .map(str::trim)
        .filter(|guid| !guid.is_empty())
    {
        return format!("id::{guid}");
    }

    let link = canonicalize(&entry.link);
    if !link.is_empty() {
        return format!("link::{link}");
    }

    let day = entry
        .published_at
        .map(|timestamp| timestamp.date_naive().to_string())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(entry.title.trim().as_bytes());
    hasher.update(b"::");
    hasher.update(day.as_bytes());
    format!("hash::{:x}", hasher.finalize())
}
