//! Outbound HTTP: one pooled client for the whole process, browser-shaped
//! page fetches with conditional validators, and passthrough streams.

use std::time::Duration;

use reqwest::header;
use url::Url;
use wikipro_core::{Error, Result, UpstreamPage};

/// Pages and the generic passthrough get 15 s; media and `/static` get 20 s.
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(15);
pub const MEDIA_TIMEOUT: Duration = Duration::from_secs(20);

/// Upstream treats bare library UAs poorly; page fetches mimic a desktop
/// browser.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const PROXY_USER_AGENT: &str = "wikipro/0.1 (+https://example.local)";

pub const DEFAULT_PAGE_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Opaque validators captured from the last successful upstream fetch.
#[derive(Debug, Clone, Default)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamFetcher {
    client: reqwest::Client,
}

impl UpstreamFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self { client })
    }

    /// Attach a client-supplied header value, dropping anything that is not a
    /// valid header value rather than failing the request.
    fn forwarded(
        rb: reqwest::RequestBuilder,
        name: header::HeaderName,
        value: Option<&str>,
        default: &str,
    ) -> reqwest::RequestBuilder {
        let value = value
            .and_then(|v| header::HeaderValue::from_str(v).ok())
            .unwrap_or_else(|| {
                header::HeaderValue::from_str(default).unwrap_or(header::HeaderValue::from_static("*/*"))
            });
        rb.header(name, value)
    }

    /// One buffered GET for an HTML page, with `If-None-Match` /
    /// `If-Modified-Since` when stored validators are present.
    pub async fn fetch_page(
        &self,
        url: &Url,
        accept: Option<&str>,
        accept_language: Option<&str>,
        validators: &Validators,
    ) -> Result<UpstreamPage> {
        let mut rb = self
            .client
            .get(url.clone())
            .timeout(PAGE_TIMEOUT)
            .header(header::USER_AGENT, BROWSER_USER_AGENT);
        rb = Self::forwarded(rb, header::ACCEPT, accept, DEFAULT_PAGE_ACCEPT);
        rb = Self::forwarded(
            rb,
            header::ACCEPT_LANGUAGE,
            accept_language,
            DEFAULT_ACCEPT_LANGUAGE,
        );
        if let Some(etag) = validators.etag.as_deref().filter(|v| !v.trim().is_empty()) {
            if let Ok(v) = header::HeaderValue::from_str(etag) {
                rb = rb.header(header::IF_NONE_MATCH, v);
            }
        }
        if let Some(lm) = validators
            .last_modified
            .as_deref()
            .filter(|v| !v.trim().is_empty())
        {
            if let Ok(v) = header::HeaderValue::from_str(lm) {
                rb = rb.header(header::IF_MODIFIED_SINCE, v);
            }
        }

        let resp = rb.send().await.map_err(|e| Error::Fetch(e.to_string()))?;
        let status = resp.status().as_u16();
        let header_str = |name: header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let content_type = header_str(header::CONTENT_TYPE);
        let etag = header_str(header::ETAG);
        let last_modified = header_str(header::LAST_MODIFIED);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?
            .to_vec();

        Ok(UpstreamPage {
            status,
            content_type,
            etag,
            last_modified,
            bytes,
        })
    }

    /// GET with the short proxy UA for asset/media passthrough. The response
    /// is returned unconsumed so callers can stream the body.
    pub async fn fetch_passthrough(
        &self,
        url: &Url,
        accept: &str,
        referer: Option<&str>,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let mut rb = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .header(header::USER_AGENT, PROXY_USER_AGENT);
        rb = Self::forwarded(rb, header::ACCEPT, Some(accept), "*/*");
        if let Some(referer) = referer.filter(|r| !r.trim().is_empty()) {
            if let Ok(v) = header::HeaderValue::from_str(referer) {
                rb = rb.header(header::REFERER, v);
            }
        }
        rb.send().await.map_err(|e| Error::Fetch(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;

    async fn spawn_fixture(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn page_fetch_sends_browser_headers_and_conditionals() {
        let app = Router::new().route(
            "/",
            get(|headers: HeaderMap| async move {
                let ua = headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                let inm = headers
                    .get("if-none-match")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                let ims = headers
                    .get("if-modified-since")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                format!("ua={ua}\ninm={inm}\nims={ims}")
            }),
        );
        let addr = spawn_fixture(app).await;

        let fetcher = UpstreamFetcher::new().unwrap();
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let validators = Validators {
            etag: Some("\"abc\"".to_string()),
            last_modified: Some("Wed, 01 Jan 2025 00:00:00 GMT".to_string()),
        };
        let page = fetcher
            .fetch_page(&url, None, Some("de-DE,de;q=0.9"), &validators)
            .await
            .unwrap();
        let body = page.text_lossy();
        assert!(body.contains("ua=Mozilla/5.0"));
        assert!(body.contains("inm=\"abc\""));
        assert!(body.contains("ims=Wed, 01 Jan 2025 00:00:00 GMT"));
    }

    #[tokio::test]
    async fn page_fetch_surfaces_304_and_validators() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    StatusCode::NOT_MODIFIED,
                    [("etag", "\"v2\""), ("last-modified", "Thu, 02 Jan 2025 00:00:00 GMT")],
                    "",
                )
            }),
        );
        let addr = spawn_fixture(app).await;

        let fetcher = UpstreamFetcher::new().unwrap();
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let page = fetcher
            .fetch_page(&url, None, None, &Validators::default())
            .await
            .unwrap();
        assert_eq!(page.status, 304);
        assert_eq!(page.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            page.last_modified.as_deref(),
            Some("Thu, 02 Jan 2025 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn passthrough_uses_proxy_ua_and_forwards_referer() {
        let app = Router::new().route(
            "/asset.css",
            get(|headers: HeaderMap| async move {
                let ua = headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                let referer = headers
                    .get("referer")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                format!("ua={ua}\nreferer={referer}")
            }),
        );
        let addr = spawn_fixture(app).await;

        let fetcher = UpstreamFetcher::new().unwrap();
        let url = Url::parse(&format!("http://{addr}/asset.css")).unwrap();
        let resp = fetcher
            .fetch_passthrough(&url, "text/css,*/*", Some("http://example.org/page"), MEDIA_TIMEOUT)
            .await
            .unwrap();
        let body = resp.text().await.unwrap();
        assert!(body.contains("ua=wikipro/0.1"));
        assert!(body.contains("referer=http://example.org/page"));
    }

    #[tokio::test]
    async fn network_failure_is_a_fetch_error() {
        let fetcher = UpstreamFetcher::new().unwrap();
        // Bind then drop a listener so the port is very likely unoccupied.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = fetcher
            .fetch_page(&url, None, None, &Validators::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }
}
