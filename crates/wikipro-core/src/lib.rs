use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("scheme not allowed: {0}")]
    SchemeNotAllowed(String),
    #[error("host not allowed: {0}")]
    HostNotAllowed(String),
    #[error("missing url parameter")]
    MissingUrl,
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where a proxied HTML response came from, exposed to clients as the
/// `X-WikiPro-Cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheState {
    Hit,
    Stale,
    Revalidated,
    Unchanged,
    Refresh,
    Miss,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Hit => "HIT",
            CacheState::Stale => "STALE",
            CacheState::Revalidated => "REVALIDATED",
            CacheState::Unchanged => "UNCHANGED",
            CacheState::Refresh => "REFRESH",
            CacheState::Miss => "MISS",
        }
    }
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cached row of rewritten HTML, keyed by `cache_key`.
///
/// Invariants the engine maintains on every upsert:
/// - `cache_key` is a pure function of `(rewrite_version, lang_key, url)`;
/// - `body_sha256` is the SHA-256 of `body`;
/// - `next_refresh_at == last_checked_at + ttl_seconds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    /// Canonical absolute URL (fragment stripped).
    pub url: String,
    pub lang_key: String,
    pub rewrite_version: u32,
    /// Upstream status stored with the body. Only 200 entries may grow TTL.
    pub status: u16,
    pub content_type: String,
    /// The rewritten HTML, not the upstream original.
    pub body: String,
    pub body_sha256: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    pub ttl_seconds: u64,
    pub next_refresh_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub last_changed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// A row serves directly (no upstream contact) until its TTL expires.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.body.is_empty() && now < self.next_refresh_at
    }
}

/// A fully buffered upstream page response. Passthrough bodies never take
/// this shape; they stream instead.
#[derive(Debug, Clone)]
pub struct UpstreamPage {
    pub status: u16,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub bytes: Vec<u8>,
}

impl UpstreamPage {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|c| c.contains("text/html"))
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }
}

/// External key-value store for cache rows. Both operations are idempotent;
/// callers treat every failure as a miss or a no-op, never as a render error.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, cache_key: &str) -> Result<Option<CacheEntry>>;
    async fn upsert(&self, entry: &CacheEntry) -> Result<()>;
}
