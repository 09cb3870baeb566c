//! Active health probing
//!
//! Each cycle attempts a lightweight CONNECT to a canary host through every
//! upstream in the current snapshot, concurrency-capped by a semaphore.
//! Probe outcomes update the record's health state and feed its breaker,
//! then refresh the pool gauges.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::GatewayMetrics;
use crate::pool::{Health, PoolRegistry, UpstreamRecord};
use crate::proxy::upstream::connect_through;

/// Configuration for health probing
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Interval between probe cycles
    pub interval: Duration,
    /// Per-probe timeout (dial + handshake)
    pub timeout: Duration,
    /// CONNECT target used to verify the upstream actually forwards
    pub canary: String,
    /// Maximum probes in flight at once
    pub max_inflight: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            canary: "www.google.com:443".to_string(),
            max_inflight: 8,
        }
    }
}

/// Periodic prober over the pool snapshot
pub struct HealthProber {
    registry: Arc<PoolRegistry>,
    metrics: Arc<GatewayMetrics>,
    config: ProbeConfig,
}

impl HealthProber {
    pub fn new(
        registry: Arc<PoolRegistry>,
        metrics: Arc<GatewayMetrics>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            config,
        }
    }

    /// Start the probe loop; runs until cancelled
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                canary = %self.config.canary,
                "health prober started"
            );

            loop {
                let start = Instant::now();
                self.probe_cycle().await;
                debug!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "probe cycle completed"
                );

                tokio::select! {
                    _ = sleep(self.config.interval) => {}
                    _ = shutdown.cancelled() => {
                        info!("health prober stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Probe every record in the current snapshot
    pub async fn probe_cycle(&self) {
        let snapshot = self.registry.current();
        if snapshot.is_empty() {
            self.metrics.observe_pool(&snapshot);
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_inflight));
        let mut handles = Vec::with_capacity(snapshot.len());

        for record in snapshot.records() {
            let record = Arc::clone(record);
            let semaphore = Arc::clone(&semaphore);
            let canary = self.config.canary.clone();
            let timeout = self.config.timeout;

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                probe_record(&record, &canary, timeout).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        self.metrics.observe_pool(&snapshot);
    }
}

/// Probe a single upstream and record the outcome
async fn probe_record(record: &UpstreamRecord, canary: &str, timeout: Duration) {
    let start = Instant::now();
    let result = connect_through(record, canary, None, timeout).await;
    record.mark_probed();

    match result {
        Ok(_stream) => {
            record.set_health(Health::Healthy);
            record.breaker().record_success();
            debug!(
                upstream = %record.identity(),
                latency_ms = start.elapsed().as_millis() as u64,
                "probe ok"
            );
        }
        Err(e) => {
            let was_healthy = record.health() == Health::Healthy;
            record.set_health(Health::Unhealthy);
            record.breaker().record_failure(Instant::now());
            if was_healthy {
                warn!(upstream = %record.identity(), error = %e, "upstream went unhealthy");
            } else {
                debug!(upstream = %record.identity(), error = %e, "probe failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BreakerConfig, UpstreamIdentity};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_fake_proxy(respond_ok: bool) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut head = Vec::new();
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let reply: &[u8] = if respond_ok {
                        b"HTTP/1.1 200 Connection Established\r\n\r\n"
                    } else {
                        b"HTTP/1.1 403 Forbidden\r\n\r\n"
                    };
                    let _ = stream.write_all(reply).await;
                });
            }
        });
        addr
    }

    fn registry_with(addr: std::net::SocketAddr) -> Arc<PoolRegistry> {
        let registry = Arc::new(PoolRegistry::new(BreakerConfig::default()));
        registry
            .replace(vec![UpstreamIdentity::parse(&format!(
                "http://{}:{}",
                addr.ip(),
                addr.port()
            ))
            .unwrap()])
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_probe_marks_healthy() {
        let addr = spawn_fake_proxy(true).await;
        let registry = registry_with(addr);
        let metrics = Arc::new(GatewayMetrics::new().unwrap());

        let prober = HealthProber::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            ProbeConfig {
                timeout: Duration::from_secs(2),
                canary: "canary.example.com:443".to_string(),
                ..ProbeConfig::default()
            },
        );

        prober.probe_cycle().await;

        let snapshot = registry.current();
        assert_eq!(snapshot.records()[0].health(), Health::Healthy);
        assert!(snapshot.records()[0].seconds_since_probe().is_some());
        assert_eq!(metrics.pool_healthy.get(), 1);
    }

    #[tokio::test]
    async fn test_probe_marks_unhealthy_on_refusal() {
        let addr = spawn_fake_proxy(false).await;
        let registry = registry_with(addr);
        let metrics = Arc::new(GatewayMetrics::new().unwrap());

        let prober = HealthProber::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            ProbeConfig {
                timeout: Duration::from_secs(2),
                canary: "canary.example.com:443".to_string(),
                ..ProbeConfig::default()
            },
        );

        prober.probe_cycle().await;

        let snapshot = registry.current();
        assert_eq!(snapshot.records()[0].health(), Health::Unhealthy);
        assert_eq!(metrics.pool_healthy.get(), 0);
    }

    #[tokio::test]
    async fn test_probe_marks_unhealthy_on_dead_port() {
        // bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = registry_with(addr);
        let metrics = Arc::new(GatewayMetrics::new().unwrap());

        let prober = HealthProber::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            ProbeConfig {
                timeout: Duration::from_millis(500),
                canary: "canary.example.com:443".to_string(),
                ..ProbeConfig::default()
            },
        );

        prober.probe_cycle().await;
        assert_eq!(registry.current().records()[0].health(), Health::Unhealthy);
    }
}
