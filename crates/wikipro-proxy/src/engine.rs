//! Endpoint orchestration: resolve a target, vet it, and run the cache
//! state machine for pages; unwrap-and-stream for media.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use url::Url;
use wikipro_core::{CacheEntry, CacheState, CacheStore, Error, Result};

use crate::allowlist::is_wikimedia_host;
use crate::config::ProxyConfig;
use crate::fetch::{UpstreamFetcher, Validators, MEDIA_TIMEOUT, PAGE_TIMEOUT};
use crate::{policy, rewrite, urls};

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Per-request client context, lifted out of the HTTP headers by the server.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub host: Option<String>,
    pub accept: Option<String>,
    pub accept_language: Option<String>,
    pub referer: Option<String>,
}

/// What the page endpoint hands back to the HTTP layer.
#[derive(Debug)]
pub enum PageOutcome {
    Html {
        status: u16,
        body: String,
        state: Option<CacheState>,
    },
    /// Upstream body was not HTML; relay it unmodified.
    Raw {
        status: u16,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
}

pub struct ProxyEngine {
    config: ProxyConfig,
    fetcher: UpstreamFetcher,
    store: Option<Arc<dyn CacheStore>>,
}

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        fetcher: UpstreamFetcher,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        Self {
            config,
            fetcher,
            store,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn served_authorities(&self, ctx: &ClientContext) -> Vec<String> {
        let mut served = Vec::new();
        if let Some(host) = &ctx.host {
            served.push(host.clone());
        }
        if let Some(host) = &self.config.public_host {
            served.push(host.clone());
        }
        served
    }

    /// The configured upstream authority is implicitly trusted alongside the
    /// Wikimedia family; everything else is refused before any fetch.
    fn ensure_allowed(&self, target: &Url) -> Result<()> {
        let host = target.host_str().unwrap_or("");
        let upstream_host = self.config.wiki_base.host_str().unwrap_or("");
        if is_wikimedia_host(host) || (!host.is_empty() && host.eq_ignore_ascii_case(upstream_host))
        {
            return Ok(());
        }
        Err(Error::HostNotAllowed(host.to_string()))
    }

    fn parse_http_target(&self, target: &str) -> Result<Url> {
        let url = Url::parse(target).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::SchemeNotAllowed(url.scheme().to_string()));
        }
        Ok(url)
    }

    /// `/m` target resolution: `url` wins over `path`; a rooted `url` value
    /// is really a path; self-referential URLs are peeled; no parameters at
    /// all means the upstream base itself.
    fn resolve_page_target(
        &self,
        url_param: Option<&str>,
        path_param: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<Url> {
        let url_param = url_param.map(str::trim).filter(|v| !v.is_empty());
        let path_param = path_param.map(str::trim).filter(|v| !v.is_empty());
        let target = match (url_param, path_param) {
            (Some(raw), _) if raw.starts_with('/') => {
                urls::absolutize(&self.config.wiki_base, raw)
            }
            (Some(raw), _) => urls::unwrap_proxy_url(
                raw,
                &self.config.wiki_base,
                &self.served_authorities(ctx),
            ),
            (None, Some(path)) => urls::absolutize(&self.config.wiki_base, path),
            (None, None) => self.config.wiki_base.to_string(),
        };
        self.parse_http_target(&target)
    }

    async fn load_entry(&self, cache_key: Option<&str>) -> Option<CacheEntry> {
        let (store, key) = (self.store.as_ref()?, cache_key?);
        match store.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, key, "cache get failed; treating as miss");
                None
            }
        }
    }

    async fn upsert_quietly(&self, entry: &CacheEntry) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert(entry).await {
                tracing::warn!(error = %e, key = %entry.cache_key, "cache upsert failed; ignoring");
            }
        }
    }

    fn stamp(entry: &mut CacheEntry, ttl: u64, now: DateTime<Utc>) {
        entry.ttl_seconds = ttl;
        entry.last_checked_at = now;
        entry.next_refresh_at = now + Duration::seconds(ttl as i64);
    }

    /// The HTML proxy state machine. Total over the optional store: with no
    /// store (or an uncacheable path) every branch degrades to fetch-and-
    /// rewrite.
    pub async fn serve_page(
        &self,
        url_param: Option<&str>,
        path_param: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<PageOutcome> {
        let target = self.resolve_page_target(url_param, path_param, ctx)?;
        self.ensure_allowed(&target)?;

        let lang = policy::lang_key(ctx.accept_language.as_deref());
        let canonical = urls::canonicalize(&target);
        let cacheable = policy::is_cacheable_path(target.path());
        let cache_key = (cacheable && self.store.is_some())
            .then(|| policy::cache_key(self.config.rewrite_version, &lang, &canonical));

        let entry = self.load_entry(cache_key.as_deref()).await;
        if let Some(entry) = &entry {
            if entry.is_fresh(Utc::now()) {
                tracing::debug!(url = %canonical, "fresh cache hit");
                return Ok(PageOutcome::Html {
                    status: entry.status,
                    body: entry.body.clone(),
                    state: Some(CacheState::Hit),
                });
            }
        }

        let validators = entry
            .as_ref()
            .map(|e| Validators {
                etag: e.etag.clone(),
                last_modified: e.last_modified.clone(),
            })
            .unwrap_or_default();

        let page = match self
            .fetcher
            .fetch_page(
                &target,
                ctx.accept.as_deref(),
                ctx.accept_language.as_deref(),
                &validators,
            )
            .await
        {
            Ok(page) => page,
            Err(e) => {
                if let Some(entry) = entry {
                    tracing::warn!(error = %e, url = %canonical, "upstream failed; serving stale copy");
                    return Ok(PageOutcome::Html {
                        status: entry.status,
                        body: entry.body,
                        state: Some(CacheState::Stale),
                    });
                }
                return Err(e);
            }
        };

        if page.status == 304 {
            if let Some(mut entry) = entry {
                let can_grow = entry.status == 200;
                let ttl = self.config.ttl.next_ttl(entry.ttl_seconds, can_grow);
                if page.etag.is_some() {
                    entry.etag = page.etag;
                }
                if page.last_modified.is_some() {
                    entry.last_modified = page.last_modified;
                }
                Self::stamp(&mut entry, ttl, Utc::now());
                self.upsert_quietly(&entry).await;
                tracing::debug!(url = %canonical, ttl, "revalidated unchanged (304)");
                return Ok(PageOutcome::Html {
                    status: entry.status,
                    body: entry.body,
                    state: Some(CacheState::Revalidated),
                });
            }
            // A 304 we never asked for; relay it rather than invent a body.
            return Ok(PageOutcome::Raw {
                status: page.status,
                content_type: page.content_type,
                bytes: page.bytes,
            });
        }

        if !page.is_html() {
            return Ok(PageOutcome::Raw {
                status: page.status,
                content_type: page.content_type,
                bytes: page.bytes,
            });
        }

        let body = rewrite::rewrite_html(&page.text_lossy(), &target);
        let hash = policy::body_sha256(&body);
        let now = Utc::now();

        if let Some(mut entry) = entry {
            let unchanged = hash == entry.body_sha256;
            let can_grow = unchanged && page.status == 200;
            let ttl = self.config.ttl.next_ttl(entry.ttl_seconds, can_grow);
            let state = if unchanged {
                CacheState::Unchanged
            } else {
                entry.last_changed_at = now;
                CacheState::Refresh
            };
            entry.status = page.status;
            entry.body = body.clone();
            entry.body_sha256 = hash;
            entry.etag = page.etag;
            entry.last_modified = page.last_modified;
            entry.fetched_at = now;
            Self::stamp(&mut entry, ttl, now);
            self.upsert_quietly(&entry).await;
            tracing::debug!(url = %canonical, ttl, state = %state, "revalidated with body");
            return Ok(PageOutcome::Html {
                status: page.status,
                body,
                state: Some(state),
            });
        }

        if let Some(cache_key) = cache_key {
            let ttl = self.config.ttl.min_seconds;
            let mut fresh = CacheEntry {
                cache_key,
                url: canonical.clone(),
                lang_key: lang,
                rewrite_version: self.config.rewrite_version,
                status: page.status,
                content_type: HTML_CONTENT_TYPE.to_string(),
                body: body.clone(),
                body_sha256: hash,
                etag: page.etag,
                last_modified: page.last_modified,
                ttl_seconds: ttl,
                next_refresh_at: now,
                fetched_at: now,
                last_checked_at: now,
                last_changed_at: now,
            };
            Self::stamp(&mut fresh, ttl, now);
            self.upsert_quietly(&fresh).await;
            tracing::debug!(url = %canonical, "cache miss stored");
            return Ok(PageOutcome::Html {
                status: page.status,
                body,
                state: Some(CacheState::Miss),
            });
        }

        Ok(PageOutcome::Html {
            status: page.status,
            body,
            state: None,
        })
    }

    /// `/i`: unwrap self-references, vet, and hand back a streaming response.
    pub async fn serve_media(
        &self,
        url_param: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<reqwest::Response> {
        let raw = url_param
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingUrl)?;
        let unwrapped =
            urls::unwrap_proxy_url(raw, &self.config.wiki_base, &self.served_authorities(ctx));
        let target = self.parse_http_target(&unwrapped)?;
        self.ensure_allowed(&target)?;

        let accept = ctx.accept.as_deref().unwrap_or("image/*,*/*");
        self.fetcher
            .fetch_passthrough(&target, accept, None, MEDIA_TIMEOUT)
            .await
    }

    /// Generic asset passthrough. `/static/*` lives on the desktop origin;
    /// everything else resolves against the upstream base. The original
    /// query string is preserved verbatim.
    pub async fn serve_passthrough(
        &self,
        path: &str,
        raw_query: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<reqwest::Response> {
        let rel = format!("/{}", path.trim_start_matches('/'));
        let is_static = rel.starts_with("/static/");
        let base = if is_static {
            &self.config.desktop_base
        } else {
            &self.config.wiki_base
        };
        let mut target = base
            .join(&rel)
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;
        target.set_query(raw_query.filter(|q| !q.is_empty()));

        let timeout = if is_static { MEDIA_TIMEOUT } else { PAGE_TIMEOUT };
        let accept = ctx.accept.as_deref().unwrap_or("*/*");
        self.fetcher
            .fetch_passthrough(&target, accept, ctx.referer.as_deref(), timeout)
            .await
    }
}
