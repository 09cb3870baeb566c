//! Metrics and status HTTP listener
//!
//! Serves the prometheus exposition at `/metrics` and small JSON status
//! endpoints consumed by the dashboard collaborator.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::metrics::GatewayMetrics;
use crate::pool::PoolRegistry;

/// HTTP body type for responses
type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub struct MetricsServer {
    config: Arc<Config>,
    registry: Arc<PoolRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl MetricsServer {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<PoolRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
        }
    }

    /// Bind the metrics listener and serve until shutdown
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.metrics_port));
        let listener = TcpListener::bind(addr)
            .await
            .context(format!("failed to bind metrics listener on {addr}"))?;

        info!("metrics listener on {addr}");
        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("metrics accept failed: {e}");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => return Ok(()),
            };

            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("metrics connection from {remote_addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => self.text_response(
                self.metrics.render(),
                "text/plain; version=0.0.4",
            ),
            (&Method::GET, "/api/upstreams") => {
                self.json_response(self.upstreams_json())
            }
            (&Method::GET, "/api/status") => self.json_response(self.status_json()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(self.string_body("not found".to_string()))
                .expect("static response")),
        }
    }

    fn upstreams_json(&self) -> serde_json::Value {
        let snapshot = self.registry.current();
        let now = Instant::now();
        let upstreams: Vec<serde_json::Value> = snapshot
            .records()
            .iter()
            .map(|record| {
                let identity = record.identity();
                let breaker = record.breaker().view(now);
                serde_json::json!({
                    "upstream": identity.to_string(),
                    "host": identity.host,
                    "port": identity.port,
                    "has_auth": identity.username.is_some(),
                    "health": record.health().name(),
                    "breaker": breaker.phase.name(),
                    "consecutive_failures": breaker.consecutive_failures,
                    "generation": record.generation(),
                    "active_connections": record
                        .active_connections
                        .load(std::sync::atomic::Ordering::Relaxed),
                    "total_connections": record
                        .total_connections
                        .load(std::sync::atomic::Ordering::Relaxed),
                    "bytes_sent": record.bytes_sent.load(std::sync::atomic::Ordering::Relaxed),
                    "bytes_received": record
                        .bytes_received
                        .load(std::sync::atomic::Ordering::Relaxed),
                    "last_probe_secs": record.seconds_since_probe(),
                })
            })
            .collect();
        serde_json::Value::Array(upstreams)
    }

    fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "auth_enabled": self.config.enable_auth,
            "active_connections": self.metrics.active_connections.get(),
            "pool_size": self.registry.current().len(),
        })
    }

    fn json_response(&self, value: serde_json::Value) -> Result<Response<BoxBody>> {
        let body = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
        self.text_response(body, "application/json")
    }

    fn text_response(&self, body: String, content_type: &str) -> Result<Response<BoxBody>> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", content_type)
            .body(self.string_body(body))
            .expect("static response"))
    }

    fn string_body(&self, s: String) -> BoxBody {
        use http_body_util::Full;
        Full::new(Bytes::from(s))
            .map_err(|never| match never {})
            .boxed()
    }
}
