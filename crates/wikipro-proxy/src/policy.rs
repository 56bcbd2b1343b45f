//! Cache key derivation and the adaptive TTL policy.

use sha2::{Digest, Sha256};

pub const DEFAULT_TTL_MIN_SECONDS: u64 = 600;
pub const DEFAULT_TTL_MAX_SECONDS: u64 = 86_400;
pub const DEFAULT_TTL_GROWTH_FACTOR: f64 = 2.0;

/// TTL bounds and growth rate. A fresh or changed body always starts at
/// `min_seconds`; every revalidation that observes unchanged 200 content may
/// multiply the TTL until `max_seconds`.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub min_seconds: u64,
    pub max_seconds: u64,
    pub growth_factor: f64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            min_seconds: DEFAULT_TTL_MIN_SECONDS,
            max_seconds: DEFAULT_TTL_MAX_SECONDS,
            growth_factor: DEFAULT_TTL_GROWTH_FACTOR,
        }
    }
}

impl TtlPolicy {
    /// Next TTL after a cache write. `can_grow` is true only when the content
    /// was observed unchanged at status 200 (a 304, or a 200 whose rewritten
    /// hash matches the stored one); anything else resets to the floor.
    pub fn next_ttl(&self, current: u64, can_grow: bool) -> u64 {
        if !can_grow {
            return self.min_seconds;
        }
        let cur = current.max(self.min_seconds);
        let mut grown = (cur as f64 * self.growth_factor).floor() as u64;
        if grown <= cur {
            // A factor at or below 1.0 must still make progress.
            grown = cur + self.min_seconds;
        }
        grown.clamp(self.min_seconds, self.max_seconds)
    }
}

/// Language discriminator folded into the cache key: the first
/// comma-separated segment of `Accept-Language`, parameters dropped,
/// lowercased, `"en"` when absent or empty.
pub fn lang_key(accept_language: Option<&str>) -> String {
    let tag = accept_language
        .unwrap_or("")
        .split(',')
        .next()
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if tag.is_empty() {
        "en".to_string()
    } else {
        tag
    }
}

/// Only article-shaped paths participate in the cache; everything else
/// (API endpoints, load.php, special pages) bypasses it entirely.
pub fn is_cacheable_path(path: &str) -> bool {
    path.is_empty() || path == "/" || path.starts_with("/wiki/") || path == "/w/index.php"
}

/// Deterministic row key: SHA-256 over a versioned composite, so bumping the
/// rewrite version retires every prior entry without deleting anything.
pub fn cache_key(rewrite_version: u32, lang_key: &str, canonical_url: &str) -> String {
    let mut h = Sha256::new();
    h.update(format!("v{rewrite_version}|{lang_key}|{canonical_url}").as_bytes());
    hex::encode(h.finalize())
}

pub fn body_sha256(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lang_key_takes_first_segment_without_params() {
        assert_eq!(lang_key(Some("en-US,en;q=0.9")), "en-us");
        assert_eq!(lang_key(Some("DE-de;q=0.8,en")), "de-de");
        assert_eq!(lang_key(Some("")), "en");
        assert_eq!(lang_key(None), "en");
        assert_eq!(lang_key(Some(" ; ")), "en");
    }

    #[test]
    fn cacheable_paths() {
        assert!(is_cacheable_path(""));
        assert!(is_cacheable_path("/"));
        assert!(is_cacheable_path("/wiki/Cat"));
        assert!(is_cacheable_path("/w/index.php"));
        assert!(!is_cacheable_path("/w/load.php"));
        assert!(!is_cacheable_path("/api/rest_v1/page"));
        assert!(!is_cacheable_path("/static/images/logo.png"));
    }

    #[test]
    fn ttl_doubles_then_clamps() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.next_ttl(600, true), 1200);
        assert_eq!(policy.next_ttl(1200, true), 2400);
        assert_eq!(policy.next_ttl(86_400, true), 86_400);
        // Below the floor, growth starts from the floor.
        assert_eq!(policy.next_ttl(0, true), 1200);
    }

    #[test]
    fn ttl_resets_without_growth() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.next_ttl(86_400, false), 600);
        assert_eq!(policy.next_ttl(0, false), 600);
    }

    #[test]
    fn degenerate_growth_factor_still_makes_progress() {
        let policy = TtlPolicy {
            min_seconds: 600,
            max_seconds: 86_400,
            growth_factor: 1.0,
        };
        assert_eq!(policy.next_ttl(600, true), 1200);
        assert_eq!(policy.next_ttl(1200, true), 1800);
    }

    #[test]
    fn key_is_64_hex_and_version_sensitive() {
        let a = cache_key(1, "en", "https://en.m.wikipedia.org/wiki/Cat");
        let b = cache_key(2, "en", "https://en.m.wikipedia.org/wiki/Cat");
        let c = cache_key(1, "de", "https://en.m.wikipedia.org/wiki/Cat");
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    proptest! {
        #[test]
        fn key_is_deterministic(version in 0u32..100, lang in "[a-z-]{0,8}", url in "[ -~]{0,80}") {
            prop_assert_eq!(
                cache_key(version, &lang, &url),
                cache_key(version, &lang, &url)
            );
        }

        // N consecutive grows never shrink and never exceed the ceiling; one
        // reset lands exactly on the floor.
        #[test]
        fn ttl_growth_is_monotone_and_clamped(start in 0u64..200_000, steps in 1usize..20) {
            let policy = TtlPolicy::default();
            let mut cur = start;
            let mut prev = cur.clamp(policy.min_seconds, policy.max_seconds);
            for _ in 0..steps {
                cur = policy.next_ttl(cur, true);
                prop_assert!(cur >= prev);
                prop_assert!(cur >= policy.min_seconds && cur <= policy.max_seconds);
                prev = cur;
            }
            prop_assert_eq!(policy.next_ttl(cur, false), policy.min_seconds);
        }
    }
}
