//! The wikipro proxy engine.
//!
//! Everything here is plumbing between a browser client and the Wikimedia
//! sites: resolve and vet a target URL, fetch it, rewrite the HTML so every
//! navigable URL routes back through the proxy, and keep a shared cache of
//! rewritten bodies with conditional revalidation and an adaptive TTL.

pub mod allowlist;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod policy;
pub mod rewrite;
pub mod store;
pub mod urls;
