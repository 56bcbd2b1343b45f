//! Router and handlers: translate HTTP requests into engine calls and
//! engine outcomes back into responses.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use wikipro_core::{CacheState, Error};
use wikipro_proxy::engine::{ClientContext, PageOutcome, ProxyEngine, HTML_CONTENT_TYPE};

const CACHE_STATE_HEADER: &str = "x-wikipro-cache";

pub fn router(engine: Arc<ProxyEngine>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/m", get(page))
        .route("/i", get(media))
        .route("/static/{*path}", get(static_asset))
        .fallback(passthrough)
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    url: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    url: Option<String>,
}

fn client_context(headers: &HeaderMap) -> ClientContext {
    let get = |name: HeaderName| {
        headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    ClientContext {
        host: get(header::HOST),
        accept: get(header::ACCEPT),
        accept_language: get(header::ACCEPT_LANGUAGE),
        referer: get(header::REFERER),
    }
}

/// Convenience bootstrap straight into a known article.
async fn root() -> impl IntoResponse {
    (
        StatusCode::FOUND,
        [(header::LOCATION, "/m?path=/wiki/The_Simpsons")],
    )
}

async fn page(
    State(engine): State<Arc<ProxyEngine>>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Response {
    let ctx = client_context(&headers);
    match engine
        .serve_page(query.url.as_deref(), query.path.as_deref(), &ctx)
        .await
    {
        Ok(PageOutcome::Html {
            status,
            body,
            state,
        }) => html_response(status, body, state),
        Ok(PageOutcome::Raw {
            status,
            content_type,
            bytes,
        }) => raw_response(status, content_type, bytes),
        Err(e) => error_response(e),
    }
}

async fn media(
    State(engine): State<Arc<ProxyEngine>>,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> Response {
    let ctx = client_context(&headers);
    match engine.serve_media(query.url.as_deref(), &ctx).await {
        Ok(upstream) => stream_response(upstream),
        Err(e) => error_response(e),
    }
}

async fn static_asset(
    State(engine): State<Arc<ProxyEngine>>,
    Path(path): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let mut ctx = client_context(&headers);
    // Only the generic passthrough forwards the client Referer.
    ctx.referer = None;
    match engine
        .serve_passthrough(&format!("static/{path}"), uri.query(), &ctx)
        .await
    {
        Ok(upstream) => stream_response(upstream),
        Err(e) => error_response(e),
    }
}

/// Everything unrouted (load.php, favicons, API calls the page makes) is
/// relayed against the configured upstream.
async fn passthrough(
    State(engine): State<Arc<ProxyEngine>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let ctx = client_context(&headers);
    match engine
        .serve_passthrough(uri.path(), uri.query(), &ctx)
        .await
    {
        Ok(upstream) => stream_response(upstream),
        Err(e) => error_response(e),
    }
}

fn html_response(status: u16, body: String, state: Option<CacheState>) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, HTML_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-store");
    if let Some(state) = state {
        builder = builder.header(CACHE_STATE_HEADER, state.as_str());
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn raw_response(status: u16, content_type: Option<String>, bytes: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(
            header::CONTENT_TYPE,
            content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
        )
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Relay an upstream response without buffering, keeping its status and
/// content type.
fn stream_response(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(err: Error) -> Response {
    let (status, body) = match err {
        Error::SchemeNotAllowed(_) | Error::InvalidUrl(_) => {
            (StatusCode::BAD_REQUEST, "Invalid scheme.".to_string())
        }
        Error::MissingUrl => (StatusCode::BAD_REQUEST, "Missing url".to_string()),
        Error::HostNotAllowed(_) => (StatusCode::FORBIDDEN, "Host not allowed.".to_string()),
        other => (
            StatusCode::BAD_GATEWAY,
            format!("Upstream fetch error: {other}"),
        ),
    };
    (status, body).into_response()
}
