//! Remote workspace API client.
//!
//! The client is the only component that talks HTTP. Every call it issues is
//! recorded in the request ledger, and throttling responses are surfaced as
//! a typed error carrying whatever retry hint the server offered, so the
//! orchestrator can arm the rate-limit tracker with server-provided truth.

use crate::cache::ResponseCache;
use crate::ledger::{RateCategory, RequestLedger};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-throttling error response from the API
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The server refused the call because a budget is exhausted
    #[error("rate limited ({category})")]
    RateLimited {
        /// Which budget tripped
        category: RateCategory,
        /// Server-provided cooldown hint, when one could be parsed
        hint: Option<RetryHint>,
    },

    /// Response body did not parse as the expected shape
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Local filesystem failure while writing a download
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Server-provided throttling details extracted from a rejection.
///
/// Everything is optional; the server may send any subset of the reset
/// timing and the budget counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryHint {
    /// When the budget resets, if the server said.
    pub reset: Option<ResetHint>,
    /// Limit the server reported for the exhausted budget.
    pub limit: Option<u64>,
    /// Remaining requests the server reported (normally zero on a trip).
    pub remaining: Option<u64>,
}

impl RetryHint {
    /// A hint carrying only a retry-after delay.
    pub fn seconds(seconds: u64) -> Self {
        Self {
            reset: Some(ResetHint::Seconds(seconds)),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.reset.is_none() && self.limit.is_none() && self.remaining.is_none()
    }
}

/// Server-provided reset timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetHint {
    /// Retry after this many seconds.
    Seconds(u64),
    /// Budget resets at this instant (Unix ms).
    EpochMs(i64),
}

/// Organization at the top of the hierarchy.
#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    /// Remote identifier.
    pub org_id: i64,
    /// Display name.
    pub name: String,
}

/// Workspace inside an organization.
#[derive(Debug, Clone, Deserialize)]
pub struct Workspace {
    /// Remote identifier.
    pub space_id: i64,
    /// Display name.
    pub name: String,
}

/// Application inside a workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct App {
    /// Remote identifier.
    pub app_id: i64,
    /// Display name.
    pub name: String,
}

/// File attachment as reported by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    /// Remote identifier.
    pub file_id: i64,
    /// File name.
    pub name: String,
    /// Size in bytes, when reported.
    pub size: Option<u64>,
    /// MIME type, when reported.
    pub mimetype: Option<String>,
    /// Download URL.
    pub link: String,
}

/// Item inside an application, with its attachments.
#[derive(Debug, Clone, Deserialize)]
pub struct Item {
    /// Remote identifier.
    pub item_id: i64,
    /// Title, when set.
    pub title: Option<String>,
    /// Attached files.
    #[serde(default)]
    pub files: Vec<RemoteFile>,
}

/// Access to the remote workspace service.
///
/// The orchestrator depends on this trait rather than on HTTP, which keeps
/// the scan and backup flows testable against an in-memory fake.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// List organizations visible to the authenticated account.
    async fn organizations(&self) -> ClientResult<Vec<Organization>>;

    /// List workspaces in an organization.
    async fn workspaces(&self, org_id: i64) -> ClientResult<Vec<Workspace>>;

    /// List applications in a workspace.
    async fn apps(&self, workspace_id: i64) -> ClientResult<Vec<App>>;

    /// Number of items in an application.
    async fn item_count(&self, app_id: i64) -> ClientResult<u64>;

    /// One page of items (with attachments) from an application.
    async fn items(&self, app_id: i64, offset: u64, limit: u64) -> ClientResult<Vec<Item>>;

    /// Files attached directly to an application rather than to its items.
    async fn app_files(&self, app_id: i64) -> ClientResult<Vec<RemoteFile>>;

    /// Download one file to `dest`, returning the bytes written.
    async fn download_file(&self, url: &str, dest: &Path) -> ClientResult<u64>;
}

/// Items fetched per page during enumeration.
pub const ITEM_PAGE_SIZE: u64 = 500;

/// HTTP implementation of [`RemoteClient`] backed by `reqwest`.
pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    ledger: RequestLedger,
    cache: Option<(ResponseCache, Duration)>,
    restricted_prefixes: Vec<String>,
}

impl HttpRemoteClient {
    /// Create a client against `base_url` authenticating with `token`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, ledger: RequestLedger) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            ledger,
            cache: None,
            // File fetches are throttled separately by the service.
            restricted_prefixes: vec!["/file".to_string()],
        }
    }

    /// Enable the read-through response cache for cacheable endpoints.
    pub fn with_cache(mut self, cache: ResponseCache, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// Override which path prefixes count against the restricted budget.
    pub fn with_restricted_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.restricted_prefixes = prefixes;
        self
    }

    fn classify(&self, path: &str) -> RateCategory {
        if self
            .restricted_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            RateCategory::Restricted
        } else {
            RateCategory::Standard
        }
    }

    /// GET `path` and parse the body as JSON.
    ///
    /// Cacheable endpoints are served from the response cache when fresh;
    /// a cache hit spends no request budget and is not ledgered.
    async fn get_json(&self, path: &str, cacheable: bool) -> ClientResult<serde_json::Value> {
        if cacheable {
            if let Some((cache, _)) = &self.cache {
                if let Some(hit) = cache.get(path) {
                    debug!(path, "API cache hit");
                    return Ok(hit);
                }
            }
        }

        let category = self.classify(path);
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        let hint = retry_hint_from_headers(response.headers());
        let body = response.text().await?;
        self.ledger.record(
            category,
            "GET",
            path,
            Some(status.as_u16()),
            Some(body.len() as u64),
        );

        if is_throttled(status.as_u16()) {
            let hint = with_body_fallback(hint, &body);
            warn!(path, status = status.as_u16(), ?hint, "Request throttled");
            return Err(ClientError::RateLimited { category, hint });
        }
        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: truncate(&body, 200),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        if cacheable {
            if let Some((cache, ttl)) = &self.cache {
                cache.set(path, &value, *ttl);
            }
        }
        Ok(value)
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn organizations(&self) -> ClientResult<Vec<Organization>> {
        let value = self.get_json("/org/", true).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn workspaces(&self, org_id: i64) -> ClientResult<Vec<Workspace>> {
        let value = self
            .get_json(&format!("/org/{org_id}/space/"), true)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn apps(&self, workspace_id: i64) -> ClientResult<Vec<App>> {
        let value = self
            .get_json(&format!("/app/space/{workspace_id}/"), true)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn item_count(&self, app_id: i64) -> ClientResult<u64> {
        let value = self.get_json(&format!("/item/app/{app_id}/count"), false).await?;
        #[derive(Deserialize)]
        struct Count {
            count: u64,
        }
        let count: Count = serde_json::from_value(value)?;
        Ok(count.count)
    }

    async fn items(&self, app_id: i64, offset: u64, limit: u64) -> ClientResult<Vec<Item>> {
        let value = self
            .get_json(
                &format!("/item/app/{app_id}/?offset={offset}&limit={limit}"),
                false,
            )
            .await?;
        #[derive(Deserialize)]
        struct Page {
            #[serde(default)]
            items: Vec<Item>,
        }
        let page: Page = serde_json::from_value(value)?;
        Ok(page.items)
    }

    async fn app_files(&self, app_id: i64) -> ClientResult<Vec<RemoteFile>> {
        let value = self
            .get_json(&format!("/file/app/{app_id}/"), false)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn download_file(&self, url: &str, dest: &Path) -> ClientResult<u64> {
        // Downloads always count against the restricted budget.
        let category = RateCategory::Restricted;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();

        if is_throttled(status.as_u16()) {
            let hint = retry_hint_from_headers(response.headers());
            let body = response.text().await.unwrap_or_default();
            self.ledger
                .record(category, "GET", url, Some(status.as_u16()), None);
            let hint = with_body_fallback(hint, &body);
            return Err(ClientError::RateLimited { category, hint });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.ledger
                .record(category, "GET", url, Some(status.as_u16()), None);
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: truncate(&body, 200),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        self.ledger
            .record(category, "GET", url, Some(status.as_u16()), Some(written));
        Ok(written)
    }
}

fn is_throttled(status: u16) -> bool {
    status == 420 || status == 429
}

fn retry_hint_from_headers(headers: &reqwest::header::HeaderMap) -> Option<RetryHint> {
    let hint = RetryHint {
        reset: header_u64(headers, "retry-after").map(ResetHint::Seconds),
        limit: header_u64(headers, "x-rate-limit-limit"),
        remaining: header_u64(headers, "x-rate-limit-remaining"),
    };
    (!hint.is_empty()).then_some(hint)
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Fill in a missing reset timing from the response body text.
fn with_body_fallback(hint: Option<RetryHint>, body: &str) -> Option<RetryHint> {
    match hint {
        Some(h) if h.reset.is_some() => Some(h),
        other => match parse_retry_seconds(body) {
            Some(seconds) => {
                let mut h = other.unwrap_or_default();
                h.reset = Some(ResetHint::Seconds(seconds));
                Some(h)
            }
            None => other,
        },
    }
}

/// Pull a cooldown out of a throttling body like
/// `"rate limit of 250/hour exceeded, wait 1800 seconds"`.
/// The number immediately preceding the word "seconds" is the hint.
fn parse_retry_seconds(body: &str) -> Option<u64> {
    let lower = body.to_ascii_lowercase();
    let pos = lower.find("second")?;
    let digits: String = lower[..pos]
        .chars()
        .rev()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
