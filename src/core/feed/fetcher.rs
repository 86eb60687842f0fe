use reqwest::header::{CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = concat!("rssr/", env!("CARGO_PKG_VERSION"), " (feed reader)");
const CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_REDIRECTS: usize = 5;

/// Conditional-request validators remembered per source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn new(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub validators: Validators,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Modified(FetchedFeed),
    NotModified,
    Failed(FetchFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchFailure {
    #[error("request failed: {0}")]
    Network(String),
    #[error("unexpected status code: {0}")]
    Http(u16),
}

impl FetchFailure {
    /// Transport errors, 429 and 5xx are worth another attempt; other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http(status) => *status == 429 || *status >= 500,
        }
    }
}

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);

    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            base_delay: Self::DEFAULT_BASE_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchClient {
    client: reqwest::Client,
}

impl FetchClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Conditional GET with retries. Never returns an error: failures are part
    /// of the outcome so callers can record them without unwinding.
    pub async fn fetch(
        &self,
        url: &str,
        validators: &Validators,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> FetchOutcome {
        let mut attempt = 0_u32;
        loop {
            match fetch_once(&self.client, url, validators, timeout).await {
                Ok(outcome) => return outcome,
                Err(failure) => {
                    if !failure.is_retryable() || attempt >= policy.retries {
                        tracing::debug!(url, attempt, error = %failure, "feed fetch giving up");
                        return FetchOutcome::Failed(failure);
                    }
                    let delay = policy.delay_for(attempt);
                    tracing::debug!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "feed fetch failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    validators: &Validators,
    timeout: Duration,
) -> Result<FetchOutcome, FetchFailure> {
    let mut request = client.get(url).timeout(timeout);
    if let Some(value) = validators.etag.as_deref() {
        request = request.header(IF_NONE_MATCH, value);
    }
    if let Some(value) = validators.last_modified.as_deref() {
        request = request.header(IF_MODIFIED_SINCE, value);
    }

    let response = request
        .send()
        .await
        .map_err(|error| FetchFailure::Network(error.to_string()))?;
    let status = response.status();
    if status == StatusCode::NOT_MODIFIED {
        return Ok(FetchOutcome::NotModified);
    }
    if !status.is_success() {
        return Err(FetchFailure::Http(status.as_u16()));
    }

    let header = |name: reqwest::header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    };
    let validators = Validators::new(header(ETAG), header(LAST_MODIFIED));
    let content_type = header(CONTENT_TYPE);
    let body = response
        .bytes()
        .await
        .map_err(|error| FetchFailure::Network(error.to_string()))?
        .to_vec();

    Ok(FetchOutcome::Modified(FetchedFeed {
        body,
        content_type,
        validators,
    }))
}
