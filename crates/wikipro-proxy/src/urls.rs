//! URL canonicalization, proxy wrappers, and self-reference unwrapping.

use url::Url;

/// Unwrapping stops after this many peels even if the URL still points at us.
pub const MAX_UNWRAP_HOPS: usize = 8;

/// Hosts treated as aliases of each other during self-reference detection.
const LOOPBACK_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "0.0.0.0", "::1"];

/// Canonical form used for cache key material and storage: the absolute URL
/// with its fragment cleared.
pub fn canonicalize(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);
    u.to_string()
}

/// Resolve `url_or_path` against `base` (RFC 3986). Empty or unresolvable
/// input yields the base itself.
pub fn absolutize(base: &Url, url_or_path: &str) -> String {
    let v = url_or_path.trim();
    if v.is_empty() {
        return base.to_string();
    }
    match base.join(v) {
        Ok(u) => u.to_string(),
        Err(_) => base.to_string(),
    }
}

/// Wrap an absolute URL into the HTML proxy endpoint. No characters are
/// considered safe; the format is embedded in stored bodies and must stay
/// stable.
pub fn page_proxy_url(target_abs: &str) -> String {
    format!("/m?url={}", urlencoding::encode(target_abs))
}

/// Wrap an absolute media URL into the image proxy endpoint.
pub fn image_proxy_url(target_abs: &str) -> String {
    format!("/i?url={}", urlencoding::encode(target_abs))
}

fn is_loopback(host: &str) -> bool {
    LOOPBACK_HOSTS.contains(&host)
}

/// Split an authority string (`Host` header shape) into a lowercase host and
/// an explicit port, tolerating bracketed IPv6.
fn split_authority(authority: &str) -> (String, Option<u16>) {
    let a = authority.trim().to_ascii_lowercase();
    if let Some(rest) = a.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    match a.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty() && !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (host.to_string(), port.parse().ok())
        }
        _ => (a, None),
    }
}

/// Does `u` point back at one of the authorities this server answers for?
/// Loopback aliases on equal ports count as the same host.
fn is_self_authority(u: &Url, served: &[String]) -> bool {
    let Some(host) = u.host_str() else {
        return false;
    };
    let host = host
        .trim_matches(|c| c == '[' || c == ']')
        .to_ascii_lowercase();
    let port = u.port();
    served.iter().any(|authority| {
        let (sh, sp) = split_authority(authority);
        (host == sh && port == sp) || (is_loopback(&host) && is_loopback(&sh) && port == sp)
    })
}

/// Recover `url`/`path` parameters from a query string, tolerating one level
/// of accidental double-encoding.
fn inner_params(raw_query: &str) -> (Option<String>, Option<String>) {
    fn parse(q: &str) -> (Option<String>, Option<String>, Vec<(String, String)>) {
        let mut url_v = None;
        let mut path_v = None;
        let mut pairs = Vec::new();
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            if url_v.is_none() && k == "url" && !v.is_empty() {
                url_v = Some(v.to_string());
            }
            if path_v.is_none() && k == "path" && !v.is_empty() {
                path_v = Some(v.to_string());
            }
            pairs.push((k.into_owned(), v.into_owned()));
        }
        (url_v, path_v, pairs)
    }

    let (mut url_v, mut path_v, mut pairs) = parse(raw_query);
    if url_v.is_none() && path_v.is_none() {
        let lowered = raw_query.to_ascii_lowercase();
        if lowered.contains("%3d") || lowered.contains("%26") {
            if let Ok(decoded) = urlencoding::decode(raw_query) {
                (url_v, path_v, pairs) = parse(&decoded);
            }
        }
    }
    if url_v.is_none() && path_v.is_none() && pairs.len() == 1 {
        // Malformed double-encoding can leave the whole "url=..." blob in the
        // key slot with an empty value.
        if let Some((k, v)) = pairs[0].0.split_once('=') {
            match k {
                "url" if !v.is_empty() => url_v = Some(v.to_string()),
                "path" if !v.is_empty() => path_v = Some(v.to_string()),
                _ => {}
            }
        }
    }
    (url_v, path_v)
}

/// Peel self-referential proxy URLs (`/m` or `/i` on one of our own
/// authorities carrying a nested `url`/`path`) down to the innermost
/// absolute target. Bounded at [`MAX_UNWRAP_HOPS`]; anything unexpected
/// stops peeling and returns the URL as it stands.
pub fn unwrap_proxy_url(input: &str, base: &Url, served: &[String]) -> String {
    let mut current = input.trim().to_string();
    for _ in 0..MAX_UNWRAP_HOPS {
        let Ok(u) = Url::parse(&current) else {
            break;
        };
        if !matches!(u.scheme(), "http" | "https") {
            break;
        }
        if !is_self_authority(&u, served) {
            break;
        }
        let (inner_url, inner_path) = inner_params(u.query().unwrap_or(""));
        match u.path() {
            "/m" => {
                if let Some(inner) = inner_url {
                    current = inner;
                } else if let Some(inner) = inner_path {
                    current = absolutize(base, &inner);
                } else {
                    break;
                }
            }
            "/i" => {
                if let Some(inner) = inner_url {
                    current = inner;
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> Url {
        Url::parse("https://en.m.wikipedia.org").unwrap()
    }

    fn served() -> Vec<String> {
        vec!["proxy.example.com".to_string()]
    }

    #[test]
    fn canonicalize_strips_fragment_only() {
        let u = Url::parse("https://en.m.wikipedia.org/wiki/Cat?x=1#History").unwrap();
        assert_eq!(canonicalize(&u), "https://en.m.wikipedia.org/wiki/Cat?x=1");
    }

    #[test]
    fn absolutize_resolves_paths_and_keeps_absolutes() {
        assert_eq!(
            absolutize(&base(), "/wiki/Dog"),
            "https://en.m.wikipedia.org/wiki/Dog"
        );
        assert_eq!(
            absolutize(&base(), "https://de.wikipedia.org/wiki/Hund"),
            "https://de.wikipedia.org/wiki/Hund"
        );
        assert_eq!(absolutize(&base(), ""), "https://en.m.wikipedia.org/");
    }

    #[test]
    fn proxy_url_encodes_without_safe_chars() {
        assert_eq!(
            page_proxy_url("https://en.m.wikipedia.org/wiki/Dog"),
            "/m?url=https%3A%2F%2Fen.m.wikipedia.org%2Fwiki%2FDog"
        );
    }

    #[test]
    fn unwraps_nested_page_wrapper() {
        let inner = "https://en.m.wikipedia.org/wiki/Cat";
        let wrapped = format!(
            "https://proxy.example.com/m?url={}",
            urlencoding::encode(inner)
        );
        assert_eq!(unwrap_proxy_url(&wrapped, &base(), &served()), inner);
    }

    #[test]
    fn unwraps_image_wrapper_inside_page_wrapper() {
        let innermost = "https://upload.wikimedia.org/foo.jpg";
        let image = format!(
            "https://proxy.example.com/i?url={}",
            urlencoding::encode(innermost)
        );
        let page = format!(
            "https://proxy.example.com/m?url={}",
            urlencoding::encode(&image)
        );
        assert_eq!(unwrap_proxy_url(&page, &base(), &served()), innermost);
    }

    #[test]
    fn unwraps_path_parameter_against_base() {
        let wrapped = "https://proxy.example.com/m?path=%2Fwiki%2FDog";
        assert_eq!(
            unwrap_proxy_url(wrapped, &base(), &served()),
            "https://en.m.wikipedia.org/wiki/Dog"
        );
    }

    #[test]
    fn recovers_double_encoded_parameters() {
        // "url=https://..." percent-encoded a second time.
        let wrapped =
            "https://proxy.example.com/m?url%3Dhttps%253A%252F%252Fen.m.wikipedia.org%252Fwiki%252FCat";
        assert_eq!(
            unwrap_proxy_url(wrapped, &base(), &served()),
            "https://en.m.wikipedia.org/wiki/Cat"
        );
    }

    #[test]
    fn foreign_hosts_are_left_alone() {
        let u = "https://evil.example.net/m?url=https%3A%2F%2Fwhatever";
        assert_eq!(unwrap_proxy_url(u, &base(), &served()), u);
    }

    #[test]
    fn non_http_schemes_are_left_alone() {
        let u = "javascript:alert(1)";
        assert_eq!(unwrap_proxy_url(u, &base(), &served()), u);
    }

    #[test]
    fn loopback_aliases_match_on_equal_ports() {
        let served = vec!["localhost:8000".to_string()];
        let wrapped = "http://127.0.0.1:8000/i?url=https%3A%2F%2Fupload.wikimedia.org%2Fx.jpg";
        assert_eq!(
            unwrap_proxy_url(wrapped, &base(), &served),
            "https://upload.wikimedia.org/x.jpg"
        );
        // Different port: not us.
        let other = "http://127.0.0.1:9000/i?url=https%3A%2F%2Fupload.wikimedia.org%2Fx.jpg";
        assert_eq!(unwrap_proxy_url(other, &base(), &served), other);
    }

    #[test]
    fn deep_nesting_terminates_at_hop_bound() {
        let mut u = "https://en.m.wikipedia.org/wiki/Cat".to_string();
        for _ in 0..(MAX_UNWRAP_HOPS + 4) {
            u = format!(
                "https://proxy.example.com/m?url={}",
                urlencoding::encode(&u)
            );
        }
        let out = unwrap_proxy_url(&u, &base(), &served());
        // Still wrapped after exhausting the budget, but finite and parseable.
        assert!(out.starts_with("https://proxy.example.com/m?url="));
    }

    proptest! {
        #[test]
        fn unwrap_is_idempotent(raw in "[ -~]{0,60}") {
            let once = unwrap_proxy_url(&raw, &base(), &served());
            let twice = unwrap_proxy_url(&once, &base(), &served());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn unwrap_never_touches_foreign_urls(path in "[a-z0-9/]{0,20}") {
            let u = format!("https://other.example.org/{path}");
            prop_assert_eq!(unwrap_proxy_url(&u, &base(), &served()), u);
        }
    }
}
