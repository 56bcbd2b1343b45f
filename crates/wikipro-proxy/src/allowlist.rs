//! Wikimedia host allowlist.
//!
//! Consulted before every outbound fetch on the page and image endpoints; a
//! host that fails here is answered with 403 and never reaches the cache.

/// Apex domains whose subdomains are all considered Wikimedia endpoints.
const APEX_DOMAINS: [&str; 11] = [
    "wikipedia.org",
    "wiktionary.org",
    "wikidata.org",
    "wikimedia.org",
    "wikibooks.org",
    "wikiquote.org",
    "wikiversity.org",
    "wikivoyage.org",
    "wikisource.org",
    "wikinews.org",
    "mediawiki.org",
];

/// Media/upload hosts matched exactly.
const EXACT_HOSTS: [&str; 2] = ["commons.wikimedia.org", "upload.wikimedia.org"];

/// Returns true iff `host` (optionally `host:port`) is a permitted Wikimedia
/// endpoint: one of the exact upload hosts, an apex domain, or a dot-suffix
/// of an apex. An empty host is never allowed.
pub fn is_wikimedia_host(host: &str) -> bool {
    let host = host
        .trim()
        .split(':')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    if EXACT_HOSTS.contains(&host.as_str()) {
        return true;
    }
    APEX_DOMAINS
        .iter()
        .any(|apex| host == *apex || host.ends_with(&format!(".{apex}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_apexes_and_subdomains() {
        assert!(is_wikimedia_host("wikipedia.org"));
        assert!(is_wikimedia_host("en.m.wikipedia.org"));
        assert!(is_wikimedia_host("de.wikivoyage.org"));
        assert!(is_wikimedia_host("commons.wikimedia.org"));
        assert!(is_wikimedia_host("upload.wikimedia.org"));
    }

    #[test]
    fn strips_ports_and_normalizes_case() {
        assert!(is_wikimedia_host("EN.Wikipedia.ORG"));
        assert!(is_wikimedia_host("en.wikipedia.org:443"));
        assert!(is_wikimedia_host(" en.wikipedia.org "));
    }

    #[test]
    fn rejects_adversarial_lookalikes() {
        assert!(!is_wikimedia_host("evilwikipedia.org"));
        assert!(!is_wikimedia_host("wikipedia.org.attacker.com"));
        assert!(!is_wikimedia_host("notwikimedia.org"));
        assert!(!is_wikimedia_host("upload.wikimedia.org.evil.net"));
        assert!(!is_wikimedia_host(""));
        assert!(!is_wikimedia_host("127.0.0.1"));
    }

    proptest! {
        // Closure: anything accepted is an exact host, an apex, or ends in ".apex".
        #[test]
        fn accepted_hosts_are_suffix_closed(host in "[a-z0-9.:-]{0,40}") {
            if is_wikimedia_host(&host) {
                let bare = host.trim().split(':').next().unwrap_or("").to_ascii_lowercase();
                let ok = EXACT_HOSTS.contains(&bare.as_str())
                    || APEX_DOMAINS
                        .iter()
                        .any(|apex| bare == *apex || bare.ends_with(&format!(".{apex}")));
                prop_assert!(ok, "accepted host escaped the closure: {bare}");
            }
        }

        // Prefixing an apex without a dot must never be enough.
        #[test]
        fn glued_prefixes_are_rejected(prefix in "[a-z0-9]{1,12}") {
            for apex in APEX_DOMAINS {
                prop_assert!(
                    !is_wikimedia_host(&format!("{}{}", prefix, apex)),
                    "glued prefix was accepted"
                );
            }
        }
    }
}
