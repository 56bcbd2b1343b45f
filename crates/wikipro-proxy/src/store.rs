//! Cache store backends.
//!
//! The engine talks to a [`CacheStore`] capability; production wires the
//! hosted Supabase table, tests and store-less deployments use
//! [`MemoryStore`] or nothing at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header;
use wikipro_core::{CacheEntry, CacheStore, Error, Result};

use crate::config::SupabaseConfig;

/// PostgREST adapter over a single table keyed by `cache_key`.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    client: reqwest::Client,
    rest_url: String,
    service_role_key: String,
}

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Cache(e.to_string()))?;
        let rest_url = format!(
            "{}/rest/v1/{}",
            config.url.trim_end_matches('/'),
            config.table
        );
        Ok(Self {
            client,
            rest_url,
            service_role_key: config.service_role_key.clone(),
        })
    }

    fn authed(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        rb.header("apikey", &self.service_role_key)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.service_role_key),
            )
            .header(header::ACCEPT, "application/json")
    }
}

#[async_trait::async_trait]
impl CacheStore for SupabaseStore {
    async fn get(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        let rb = self.client.get(&self.rest_url).query(&[
            ("select", "*"),
            ("cache_key", &format!("eq.{cache_key}")),
            ("limit", "1"),
        ]);
        let resp = self
            .authed(rb)
            .send()
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Cache(format!("store get HTTP {status}")));
        }
        let rows: Vec<CacheEntry> = resp.json().await.map_err(|e| Error::Cache(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let rb = self
            .client
            .post(&self.rest_url)
            .query(&[("on_conflict", "cache_key")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[entry]);
        let resp = self
            .authed(rb)
            .send()
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Cache(format!("store upsert HTTP {status}")));
        }
        Ok(())
    }
}

/// Process-local store. Handy for tests and single-node setups; rows die
/// with the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| Error::Cache("poisoned".to_string()))?;
        Ok(rows.get(cache_key).cloned())
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| Error::Cache("poisoned".to_string()))?;
        rows.insert(entry.cache_key.clone(), entry.clone());
        Ok(())
    }
}
