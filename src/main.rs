use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod config;
mod core;
mod lb;
mod metrics;
mod pool;
mod proxy;
mod reload;

use crate::core::Core;
use crate::metrics::MetricsServer;

#[derive(Parser)]
#[command(name = "proxy-guard")]
#[command(version, about = "Rotating HTTP proxy gateway with HMAC auth and health probing", long_about = None)]
struct Cli {
    /// Client-facing listener port (overrides PROXY_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Metrics/status listener port (overrides METRICS_PORT)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Upstream list file (overrides PG_PROXY_FILE)
    #[arg(long)]
    proxy_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // One task per session plus the background loops: multi-threaded
    // runtime throughout
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = config::load_from_env().context("invalid configuration")?;
    if let Some(port) = cli.port {
        config.proxy_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics_port = port;
    }
    if let Some(file) = cli.proxy_file {
        config.proxy_file = file.into();
    }

    let proxy_port = config.proxy_port;
    let core = Core::new(config)?;

    let shutdown = CancellationToken::new();
    let background = core.spawn_background_tasks(&shutdown);

    // metrics/status listener; if it cannot bind the gateway keeps
    // serving traffic with observability degraded
    let metrics_server = MetricsServer::new(
        Arc::clone(&core.config),
        Arc::clone(&core.registry),
        Arc::clone(&core.metrics),
    );
    let metrics_handle = {
        let token = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run(token).await {
                error!("metrics listener failed: {e:#}");
            }
        })
    };

    spawn_signal_handler(shutdown.clone())?;

    println!("proxy-guard | port {proxy_port}");
    let result = proxy::run_server(core, shutdown.clone()).await;

    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }
    let _ = metrics_handle.await;

    info!("shutdown complete");
    result
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("shutdown signal received, draining connections");
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining connections");
            shutdown.cancel();
        });
    }

    Ok(())
}
