//! Gateway metrics
//!
//! Counters and gauges exported in prometheus exposition format, plus the
//! metrics/status HTTP listener. Metrics live on an explicit registry so
//! tests can build as many instances as they like.

mod server;

pub use server::MetricsServer;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Instant;

use crate::pool::PoolSnapshot;
use crate::pool::{BreakerPhase, Health};

/// Request outcome labels for `requests_total`
pub mod result {
    pub const TUNNEL: &str = "tunnel";
    pub const HTTP: &str = "http";
    pub const AUTH_REJECTED: &str = "auth_rejected";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NO_UPSTREAM: &str = "no_upstream";
    pub const UPSTREAM_ERROR: &str = "upstream_error";
    pub const TIMEOUT: &str = "timeout";
}

/// All gateway counters and gauges
pub struct GatewayMetrics {
    registry: Registry,

    /// Sessions by outcome
    pub requests_total: IntCounterVec,
    /// Bytes relayed client -> upstream
    pub bytes_up_total: IntCounter,
    /// Bytes relayed upstream -> client
    pub bytes_down_total: IntCounter,
    /// Rejected authentication attempts
    pub auth_failures_total: IntCounter,
    /// Dial/handshake failures by upstream
    pub upstream_failures_total: IntCounterVec,
    /// Upstreams in the current snapshot
    pub pool_size: IntGauge,
    /// Upstreams currently probing healthy
    pub pool_healthy: IntGauge,
    /// 1 while an upstream's breaker rejects traffic
    pub breaker_open: IntGaugeVec,
    /// Live client connections
    pub active_connections: IntGauge,
    /// Aborted proxy-file reloads
    pub reload_errors_total: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Proxy sessions by outcome"),
            &["result"],
        )?;
        let bytes_up_total = IntCounter::new(
            "bytes_up_total",
            "Bytes relayed from clients to upstreams",
        )?;
        let bytes_down_total = IntCounter::new(
            "bytes_down_total",
            "Bytes relayed from upstreams to clients",
        )?;
        let auth_failures_total =
            IntCounter::new("auth_failures_total", "Rejected authentication attempts")?;
        let upstream_failures_total = IntCounterVec::new(
            Opts::new(
                "upstream_failures_total",
                "Upstream dial and handshake failures",
            ),
            &["upstream"],
        )?;
        let pool_size = IntGauge::new("pool_size", "Upstreams in the current snapshot")?;
        let pool_healthy = IntGauge::new("pool_healthy", "Upstreams probing healthy")?;
        let breaker_open = IntGaugeVec::new(
            Opts::new("breaker_open", "1 while the upstream's breaker is open"),
            &["upstream"],
        )?;
        let active_connections =
            IntGauge::new("active_connections", "Live client connections")?;
        let reload_errors_total =
            IntCounter::new("reload_errors_total", "Aborted proxy-file reloads")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(bytes_up_total.clone()))?;
        registry.register(Box::new(bytes_down_total.clone()))?;
        registry.register(Box::new(auth_failures_total.clone()))?;
        registry.register(Box::new(upstream_failures_total.clone()))?;
        registry.register(Box::new(pool_size.clone()))?;
        registry.register(Box::new(pool_healthy.clone()))?;
        registry.register(Box::new(breaker_open.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(reload_errors_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            bytes_up_total,
            bytes_down_total,
            auth_failures_total,
            upstream_failures_total,
            pool_size,
            pool_healthy,
            breaker_open,
            active_connections,
            reload_errors_total,
        })
    }

    /// Count a finished session under its outcome label
    pub fn record_request(&self, result: &str) {
        self.requests_total.with_label_values(&[result]).inc();
    }

    /// Count a failure against a specific upstream
    pub fn record_upstream_failure(&self, upstream: &str) {
        self.upstream_failures_total
            .with_label_values(&[upstream])
            .inc();
    }

    /// Refresh the pool gauges from a snapshot
    ///
    /// Resets the per-upstream breaker gauge first so labels for removed
    /// upstreams don't linger.
    pub fn observe_pool(&self, snapshot: &PoolSnapshot) {
        let now = Instant::now();
        self.pool_size.set(snapshot.len() as i64);

        let healthy = snapshot
            .records()
            .iter()
            .filter(|r| r.health() == Health::Healthy)
            .count();
        self.pool_healthy.set(healthy as i64);

        self.breaker_open.reset();
        for record in snapshot.records() {
            let open = record.breaker().view(now).phase == BreakerPhase::Open;
            self.breaker_open
                .with_label_values(&[&record.identity().label()])
                .set(open as i64);
        }
    }

    /// Render all metrics in prometheus text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BreakerConfig, PoolRegistry, UpstreamIdentity};

    #[test]
    fn test_counters_render() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_request(result::TUNNEL);
        metrics.record_request(result::NO_UPSTREAM);
        metrics.bytes_up_total.inc_by(42);

        let output = metrics.render();
        assert!(output.contains("requests_total{result=\"tunnel\"} 1"));
        assert!(output.contains("requests_total{result=\"no_upstream\"} 1"));
        assert!(output.contains("bytes_up_total 42"));
    }

    #[test]
    fn test_observe_pool_gauges() {
        let metrics = GatewayMetrics::new().unwrap();
        let registry = PoolRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        });
        let snapshot = registry
            .replace(vec![
                UpstreamIdentity::parse("http://a.example.com:1080").unwrap(),
                UpstreamIdentity::parse("http://b.example.com:1080").unwrap(),
            ])
            .unwrap();

        snapshot.records()[0].set_health(crate::pool::Health::Healthy);
        registry.report_result(
            &UpstreamIdentity::parse("http://b.example.com:1080").unwrap(),
            false,
        );

        metrics.observe_pool(&snapshot);
        assert_eq!(metrics.pool_size.get(), 2);
        assert_eq!(metrics.pool_healthy.get(), 1);

        let output = metrics.render();
        assert!(output.contains("breaker_open{upstream=\"a.example.com:1080\"} 0"));
        assert!(output.contains("breaker_open{upstream=\"b.example.com:1080\"} 1"));
    }

    #[test]
    fn test_independent_instances() {
        // explicit registries mean no global-registration clashes
        let a = GatewayMetrics::new().unwrap();
        let b = GatewayMetrics::new().unwrap();
        a.record_request(result::TUNNEL);
        assert!(a.render().contains("requests_total{result=\"tunnel\"} 1"));
        assert!(b.render().contains("bytes_up_total 0"));
    }
}
