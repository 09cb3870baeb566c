//! Core shared by the proxy server, the metrics endpoint and the
//! background tasks
//!
//! Owns the configuration, the pool registry, the selector with its sticky
//! map, the authenticator and the metrics registry. Clones share the same
//! underlying state.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::lb::{HealthProber, ProbeConfig, Selector, StickyMap};
use crate::metrics::GatewayMetrics;
use crate::pool::{BreakerConfig, PoolRegistry, UpstreamIdentity};
use crate::reload::{merge_env_seed, parse_proxy_lines, ReloadWatcher};

/// How often expired sticky bindings are swept
const STICKY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub registry: Arc<PoolRegistry>,
    pub selector: Arc<Selector>,
    pub sticky: Arc<StickyMap>,
    pub metrics: Arc<GatewayMetrics>,
    pub authenticator: Authenticator,
    env_seed: Vec<UpstreamIdentity>,
}

impl Core {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let metrics =
            Arc::new(GatewayMetrics::new().context("failed to build metrics registry")?);
        let registry = Arc::new(PoolRegistry::new(BreakerConfig::default()));

        // env-seeded upstreams are static config: a bad entry is fatal
        let mut env_seed: Vec<UpstreamIdentity> = Vec::new();
        for raw in &config.proxy_list {
            let identity = UpstreamIdentity::parse(raw)
                .with_context(|| format!("invalid PG_PROXY_LIST entry {raw:?}"))?;
            if !env_seed.contains(&identity) {
                env_seed.push(identity);
            }
        }

        // the proxy file may be absent or broken at startup; the watcher
        // will pick it up once it is fixed
        let from_file = match std::fs::read_to_string(&config.proxy_file) {
            Ok(content) => match parse_proxy_lines(&content) {
                Ok(identities) => identities,
                Err(e) => {
                    warn!(
                        path = %config.proxy_file.display(),
                        error = %e,
                        "ignoring unparseable proxy file at startup"
                    );
                    metrics.reload_errors_total.inc();
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %config.proxy_file.display(), "proxy file not found at startup");
                Vec::new()
            }
            Err(e) => {
                warn!(
                    path = %config.proxy_file.display(),
                    error = %e,
                    "could not read proxy file at startup"
                );
                Vec::new()
            }
        };

        let seed = merge_env_seed(from_file, &env_seed);
        let snapshot = registry
            .replace(seed)
            .context("failed to seed upstream pool")?;
        metrics.observe_pool(&snapshot);
        info!(size = snapshot.len(), "initialized upstream pool");

        let sticky = Arc::new(StickyMap::new(config.sticky_ttl()));
        let selector = Arc::new(Selector::new(Arc::clone(&registry), Arc::clone(&sticky)));
        let authenticator = Authenticator::new(&config.secret);

        Ok(Self {
            config,
            registry,
            selector,
            sticky,
            metrics,
            authenticator,
            env_seed,
        })
    }

    /// Spawn the health prober, the reload watcher and the sticky sweeper
    pub fn spawn_background_tasks(
        &self,
        shutdown: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let prober = Arc::new(HealthProber::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            ProbeConfig {
                interval: self.config.health_check_interval(),
                canary: self.config.health_canary.clone(),
                ..ProbeConfig::default()
            },
        ));
        handles.push(prober.start(shutdown.child_token()));

        let watcher = ReloadWatcher::new(
            self.config.proxy_file.clone(),
            self.env_seed.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );
        handles.push(watcher.start(shutdown.child_token()));

        let sticky = Arc::clone(&self.sticky);
        let sweep_shutdown = shutdown.child_token();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(STICKY_SWEEP_INTERVAL) => {}
                    _ = sweep_shutdown.cancelled() => return,
                }
                let dropped = sticky.sweep(Instant::now());
                if dropped > 0 {
                    debug!(dropped, "swept expired sticky bindings");
                }
            }
        }));

        handles
    }
}
