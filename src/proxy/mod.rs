//! Proxy data plane
//!
//! This module implements the client-facing listener and the per-session
//! tunnel engine: CONNECT tunneling for TLS traffic and forward-proxy
//! semantics for plain HTTP, both relayed through a selected upstream.

pub mod http;
pub mod server;
pub mod tunnel;
pub mod upstream;

pub use server::ProxyServer;
pub use tunnel::{TunnelConfig, TunnelEngine};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::core::Core;

/// Run the proxy server until the shutdown token fires
pub async fn run_server(core: Core, shutdown: CancellationToken) -> Result<()> {
    let server = ProxyServer::new(core);
    server.run(shutdown).await
}
