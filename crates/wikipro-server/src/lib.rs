//! HTTP surface for the wikipro proxy. The binary wires environment
//! configuration into [`wikipro_proxy::engine::ProxyEngine`] and serves the
//! router exposed here; tests drive the same router against fixture
//! upstreams.

pub mod routes;
