//! Client-facing proxy listener

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::Core;
use crate::proxy::tunnel::{TunnelConfig, TunnelEngine};

/// How long draining sessions get after a shutdown signal
const DRAIN_WINDOW: Duration = Duration::from_secs(10);

/// Proxy server state
pub struct ProxyServer {
    core: Core,
}

impl ProxyServer {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// Bind the client listener and serve until shutdown
    ///
    /// A bind failure is fatal; everything after that is per-session and
    /// never takes the server down.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.core.config.proxy_port));
        let listener = TcpListener::bind(addr)
            .await
            .context(format!("failed to bind proxy listener on {addr}"))?;

        info!(
            "proxy listener on {addr} (auth {})",
            if self.core.config.enable_auth {
                "enabled"
            } else {
                "disabled"
            }
        );

        let engine = Arc::new(TunnelEngine::new(
            self.core.authenticator.clone(),
            Arc::clone(&self.core.selector),
            Arc::clone(&self.core.registry),
            Arc::clone(&self.core.metrics),
            TunnelConfig {
                enable_auth: self.core.config.enable_auth,
                connect_timeout: self.core.config.connect_timeout(),
                idle_timeout: self.core.config.idle_timeout(),
                ..TunnelConfig::default()
            },
        ));

        // sessions are tracked so shutdown can abort the stragglers
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("failed to accept connection: {e}");
                            continue;
                        }
                    };
                    let engine = Arc::clone(&engine);
                    let session_token = shutdown.child_token();
                    sessions.spawn(async move {
                        engine.handle(stream, peer, session_token).await;
                    });
                }
                // reap finished sessions so the set doesn't grow unbounded
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.cancelled() => break,
            }
        }

        drop(listener);
        drain(&mut sessions).await;
        info!("proxy listener stopped");
        Ok(())
    }
}

/// Wait for in-flight sessions, then force-close whatever remains
///
/// Sessions observe the cancelled token and exit on their own; once the
/// drain window lapses the remaining tasks are aborted, dropping their
/// sockets.
async fn drain(sessions: &mut JoinSet<()>) {
    if sessions.is_empty() {
        return;
    }
    info!(sessions = sessions.len(), "draining active connections");

    let all_done = tokio::time::timeout(DRAIN_WINDOW, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if all_done.is_err() {
        error!(
            remaining = sessions.len(),
            "drain window elapsed, force-closing remaining sessions"
        );
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}
