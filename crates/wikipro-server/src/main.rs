use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wikipro_core::CacheStore;
use wikipro_proxy::config::ProxyConfig;
use wikipro_proxy::engine::ProxyEngine;
use wikipro_proxy::fetch::UpstreamFetcher;
use wikipro_proxy::store::SupabaseStore;

use wikipro::routes;

fn listen_addr() -> String {
    std::env::var("WIKIPRO_LISTEN")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "127.0.0.1:8000".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = ProxyConfig::from_env()?;
    let store: Option<Arc<dyn CacheStore>> = match &config.supabase {
        Some(supabase) => Some(Arc::new(SupabaseStore::new(supabase)?)),
        None => None,
    };
    info!(
        upstream = %config.wiki_base,
        cache_enabled = store.is_some(),
        rewrite_version = config.rewrite_version,
        "starting wikipro"
    );

    let engine = Arc::new(ProxyEngine::new(
        config,
        UpstreamFetcher::new()?,
        store,
    ));
    let app = routes::router(engine);

    let addr = listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
