//! Process configuration, read once from the environment at startup and
//! immutable afterwards.

use std::str::FromStr;

use url::Url;
use wikipro_core::{Error, Result};

use crate::policy::{
    TtlPolicy, DEFAULT_TTL_GROWTH_FACTOR, DEFAULT_TTL_MAX_SECONDS, DEFAULT_TTL_MIN_SECONDS,
};

/// Mobile Wikipedia is the default upstream for pages.
pub const DEFAULT_WIKI_BASE: &str = "https://en.m.wikipedia.org";
/// `/static/*` assets live on the desktop site, not the mobile one.
pub const DEFAULT_DESKTOP_BASE: &str = "https://en.wikipedia.org";
pub const DEFAULT_CACHE_TABLE: &str = "wiki_cache";
pub const DEFAULT_REWRITE_VERSION: u32 = 1;

/// Wiring for the hosted cache store. Cache support is entirely optional:
/// without both the URL and the key the proxy runs statelessly.
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_role_key: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub wiki_base: Url,
    pub desktop_base: Url,
    /// Folded into every cache key; bump to retire all existing entries.
    pub rewrite_version: u32,
    pub ttl: TtlPolicy,
    /// Externally visible authority accepted by the unwrapper in addition to
    /// the request `Host` header (for deployments behind a reverse proxy).
    pub public_host: Option<String>,
    pub supabase: Option<SupabaseConfig>,
}

pub(crate) fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_nonempty(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let wiki_base =
            env_nonempty("WIKI_BASE").unwrap_or_else(|| DEFAULT_WIKI_BASE.to_string());
        let wiki_base =
            Url::parse(&wiki_base).map_err(|e| Error::InvalidUrl(format!("WIKI_BASE: {e}")))?;
        let desktop_base =
            Url::parse(DEFAULT_DESKTOP_BASE).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let min_seconds = env_parse("CACHE_TTL_MIN_SECONDS", DEFAULT_TTL_MIN_SECONDS);
        let max_seconds = env_parse("CACHE_TTL_MAX_SECONDS", DEFAULT_TTL_MAX_SECONDS).max(min_seconds);
        let growth_factor = env_parse("CACHE_TTL_GROWTH_FACTOR", DEFAULT_TTL_GROWTH_FACTOR);

        let supabase = match (
            env_nonempty("SUPABASE_URL"),
            env_nonempty("SUPABASE_SERVICE_ROLE_KEY"),
        ) {
            (Some(url), Some(service_role_key)) => Some(SupabaseConfig {
                url,
                service_role_key,
                table: env_nonempty("WIKI_CACHE_TABLE")
                    .unwrap_or_else(|| DEFAULT_CACHE_TABLE.to_string()),
            }),
            _ => None,
        };

        Ok(Self {
            wiki_base,
            desktop_base,
            rewrite_version: env_parse("CACHE_REWRITE_VERSION", DEFAULT_REWRITE_VERSION),
            ttl: TtlPolicy {
                min_seconds,
                max_seconds,
                growth_factor,
            },
            public_host: env_nonempty("WIKIPRO_PUBLIC_HOST"),
            supabase,
        })
    }

    /// A config pointing at an explicit upstream, defaults everywhere else.
    /// Used by tests and embedders; `from_env` is the production path.
    pub fn for_upstream(wiki_base: Url, desktop_base: Url) -> Self {
        Self {
            wiki_base,
            desktop_base,
            rewrite_version: DEFAULT_REWRITE_VERSION,
            ttl: TtlPolicy::default(),
            public_host: None,
            supabase: None,
        }
    }
}
