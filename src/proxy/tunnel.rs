//! Per-session tunnel engine
//!
//! Each accepted client connection runs the same pipeline: read and parse
//! the request head, authenticate, select an upstream (retrying across
//! distinct pool members on dial failure), establish the tunnel or forward
//! the rewritten request, then relay bytes in both directions until either
//! side closes. The outcome feeds the upstream's breaker and, on a
//! breaker-tripping failure, invalidates the client's sticky binding.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{decode_basic_authorization, AuthError, Authenticator};
use crate::lb::{SelectError, Selector};
use crate::metrics::{result, GatewayMetrics};
use crate::pool::{Admission, PoolRegistry, UpstreamIdentity, UpstreamRecord};
use crate::proxy::http::{build_forward_head, read_request_head, HttpError, RequestHead};
use crate::proxy::upstream::{connect_through, dial, set_fast_socket, UpstreamError};

/// Relay copy buffer size
const RELAY_BUFFER: usize = 64 * 1024;

/// Tunnel engine settings
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// When false, every session authenticates as its remote address
    pub enable_auth: bool,
    /// Upstream dial + handshake timeout
    pub connect_timeout: Duration,
    /// Per-direction relay idle-read timeout
    pub idle_timeout: Duration,
    /// Distinct upstreams tried before giving up on a session
    pub max_attempts: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enable_auth: true,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            max_attempts: 3,
        }
    }
}

/// How a session failed to reach any upstream
enum EstablishError {
    /// No candidate was eligible at all
    NoUpstream,
    /// Every attempt failed; carries the last upstream error
    Exhausted(UpstreamError),
    /// Shutdown fired mid-establish; the session just closes
    Cancelled,
}

/// What we are asking the upstream to do
enum DialPlan<'a> {
    /// CONNECT tunnel to the target authority
    Connect {
        target: &'a str,
        user_agent: Option<&'a str>,
    },
    /// Forward a rewritten plain request; the head is unterminated so the
    /// per-record auth line can be appended
    Forward { forward_head: &'a str },
}

/// Shared per-process tunnel state; one instance serves all sessions
pub struct TunnelEngine {
    authenticator: Authenticator,
    selector: Arc<Selector>,
    registry: Arc<PoolRegistry>,
    metrics: Arc<GatewayMetrics>,
    config: TunnelConfig,
}

impl TunnelEngine {
    pub fn new(
        authenticator: Authenticator,
        selector: Arc<Selector>,
        registry: Arc<PoolRegistry>,
        metrics: Arc<GatewayMetrics>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            authenticator,
            selector,
            registry,
            metrics,
            config,
        }
    }

    /// Handle one accepted client connection end to end
    ///
    /// Never returns an error: every failure is answered on the wire and
    /// logged, and the connection is closed on all paths. The gauge guard
    /// decrements even when the session task is aborted at shutdown.
    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let _active = ConnectionGauge::new(&self.metrics.active_connections);
        self.serve(stream, peer, shutdown).await;
    }

    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        set_fast_socket(&stream);

        let (head, early) = tokio::select! {
            read = timeout(self.config.idle_timeout, read_request_head(&mut stream)) => {
                match read {
                    Ok(Ok(parsed)) => parsed,
                    Ok(Err(HttpError::UnexpectedEof)) => return,
                    Ok(Err(e)) => {
                        debug!(client = %peer, error = %e, phase = "read_head", "bad request");
                        self.metrics.record_request(result::BAD_REQUEST);
                        respond(&mut stream, 400, "Bad Request", &[], "").await;
                        return;
                    }
                    Err(_) => return,
                }
            }
            _ = shutdown.cancelled() => return,
        };

        let client_id = match self.authenticate(&head, peer) {
            Ok(client_id) => client_id,
            Err(e) => {
                warn!(
                    client = %peer,
                    client_id = e.client_id().unwrap_or("unknown"),
                    phase = "auth",
                    error = %e,
                    "authentication rejected"
                );
                self.metrics.auth_failures_total.inc();
                self.metrics.record_request(result::AUTH_REJECTED);
                respond(
                    &mut stream,
                    407,
                    "Proxy Authentication Required",
                    &[("Proxy-Authenticate", "Basic realm=\"proxy-guard\"")],
                    "",
                )
                .await;
                return;
            }
        };

        if head.is_connect() {
            self.serve_connect(stream, head, early, &client_id, peer, shutdown)
                .await;
        } else {
            self.serve_plain(stream, head, early, &client_id, peer, shutdown)
                .await;
        }
    }

    fn authenticate(&self, head: &RequestHead, peer: SocketAddr) -> Result<String, AuthError> {
        if !self.config.enable_auth {
            return Ok(peer.ip().to_string());
        }

        let token = head
            .header("x-pg-auth")
            .map(|v| v.trim().to_string())
            .or_else(|| {
                head.header("proxy-authorization")
                    .and_then(decode_basic_authorization)
            })
            .or_else(|| head.userinfo())
            .ok_or(AuthError::MissingCredentials)?;

        self.authenticator.verify(&token)
    }

    async fn serve_connect(
        &self,
        mut stream: TcpStream,
        head: RequestHead,
        early: Vec<u8>,
        client_id: &str,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let target = match head.authority() {
            Ok(authority) => authority,
            Err(e) => {
                debug!(client_id, error = %e, phase = "parse_target", "bad CONNECT target");
                self.metrics.record_request(result::BAD_REQUEST);
                respond(&mut stream, 400, "Bad Request", &[], "").await;
                return;
            }
        };

        let plan = DialPlan::Connect {
            target: &target,
            user_agent: head.header("user-agent"),
        };
        let (upstream_stream, record, admission) =
            match self.establish(client_id, plan, &shutdown).await {
                Ok(established) => established,
                Err(EstablishError::Cancelled) => return,
                Err(e) => {
                    self.reject_unestablished(&mut stream, e, client_id, &target).await;
                    return;
                }
            };

        if stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .is_err()
        {
            // client vanished between handshakes; nothing to relay, and
            // the upstream proved nothing either way
            record.end_session();
            if admission == Admission::Probe {
                record.breaker().release_probe();
            }
            return;
        }

        self.metrics.record_request(result::TUNNEL);
        debug!(client_id, dst = %target, upstream = %record.identity(), client = %peer, "tunnel established");
        self.relay_session(stream, upstream_stream, early, record, admission, client_id, shutdown)
            .await;
    }

    async fn serve_plain(
        &self,
        mut stream: TcpStream,
        head: RequestHead,
        early: Vec<u8>,
        client_id: &str,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let forward_head = match build_forward_head(&head) {
            Ok(forward_head) => forward_head,
            Err(e) => {
                debug!(client_id, error = %e, phase = "rewrite", "unforwardable request");
                self.metrics.record_request(result::BAD_REQUEST);
                respond(&mut stream, 400, "Bad Request", &[], "").await;
                return;
            }
        };

        let plan = DialPlan::Forward {
            forward_head: &forward_head,
        };
        let (upstream_stream, record, admission) =
            match self.establish(client_id, plan, &shutdown).await {
                Ok(established) => established,
                Err(EstablishError::Cancelled) => return,
                Err(e) => {
                    self.reject_unestablished(&mut stream, e, client_id, &head.target)
                        .await;
                    return;
                }
            };

        self.metrics.record_request(result::HTTP);
        debug!(client_id, dst = %head.target, upstream = %record.identity(), client = %peer, "forwarding request");
        self.relay_session(stream, upstream_stream, early, record, admission, client_id, shutdown)
            .await;
    }

    /// Select an upstream and open a connection through it, retrying
    /// across distinct pool members on failure
    ///
    /// Races every attempt against shutdown so a draining server is not
    /// held up by dial timeouts; an attempt abandoned mid-flight gives
    /// back its session count and any claimed probe slot.
    async fn establish(
        &self,
        client_id: &str,
        plan: DialPlan<'_>,
        shutdown: &CancellationToken,
    ) -> Result<(TcpStream, Arc<UpstreamRecord>, Admission), EstablishError> {
        let mut tried: Vec<UpstreamIdentity> = Vec::new();
        let mut last_error: Option<UpstreamError> = None;

        for attempt in 0..self.config.max_attempts {
            if shutdown.is_cancelled() {
                return Err(EstablishError::Cancelled);
            }

            let selection = match self.selector.select_excluding(client_id, &tried) {
                Ok(selection) => selection,
                Err(SelectError::NoUpstreamAvailable) => break,
            };
            let record = selection.record;
            let admission = selection.admission;
            let identity = record.identity().clone();
            record.begin_session();

            let attempt_fut = async {
                match &plan {
                    DialPlan::Connect { target, user_agent } => {
                        connect_through(&record, target, *user_agent, self.config.connect_timeout)
                            .await
                    }
                    DialPlan::Forward { forward_head } => {
                        self.dial_and_forward(&record, forward_head).await
                    }
                }
            };
            let result = tokio::select! {
                result = attempt_fut => result,
                _ = shutdown.cancelled() => {
                    record.end_session();
                    if admission == Admission::Probe {
                        record.breaker().release_probe();
                    }
                    return Err(EstablishError::Cancelled);
                }
            };

            match result {
                Ok(stream) => return Ok((stream, record, admission)),
                Err(e) => {
                    warn!(
                        client_id,
                        upstream = %identity,
                        attempt = attempt + 1,
                        max_attempts = self.config.max_attempts,
                        phase = "establish",
                        error = %e,
                        "upstream attempt failed"
                    );
                    record.end_session();
                    self.registry.report_result(&identity, false);
                    self.metrics.record_upstream_failure(&identity.label());
                    self.selector.sticky().invalidate(client_id);
                    tried.push(identity);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(EstablishError::Exhausted(e)),
            None => Err(EstablishError::NoUpstream),
        }
    }

    async fn dial_and_forward(
        &self,
        record: &UpstreamRecord,
        forward_head: &str,
    ) -> Result<TcpStream, UpstreamError> {
        let mut stream = dial(record, self.config.connect_timeout).await?;
        let mut full = forward_head.to_string();
        if let Some(payload) = record.auth_payload() {
            full.push_str("Proxy-Authorization: Basic ");
            full.push_str(payload);
            full.push_str("\r\n");
        }
        full.push_str("\r\n");
        stream
            .write_all(full.as_bytes())
            .await
            .map_err(UpstreamError::HandshakeIo)?;
        Ok(stream)
    }

    async fn reject_unestablished(
        &self,
        stream: &mut TcpStream,
        error: EstablishError,
        client_id: &str,
        target: &str,
    ) {
        match error {
            EstablishError::NoUpstream => {
                warn!(client_id, dst = %target, phase = "select", "no upstream available");
                self.metrics.record_request(result::NO_UPSTREAM);
                respond(stream, 502, "Bad Gateway", &[], "no upstream available").await;
            }
            EstablishError::Exhausted(e) if e.is_timeout() => {
                self.metrics.record_request(result::TIMEOUT);
                respond(stream, 504, "Gateway Timeout", &[], "").await;
            }
            EstablishError::Exhausted(e) => {
                self.metrics.record_request(result::UPSTREAM_ERROR);
                // the upstream's own verdict passes through; plain dial
                // failures have no status and map to 502
                let status = e.upstream_status().unwrap_or(502);
                respond(stream, status, reason_phrase(status), &[], "").await;
            }
            // callers return before reaching here; nothing to answer
            EstablishError::Cancelled => {}
        }
    }

    /// Pump bytes both ways until either side closes, then settle the
    /// session outcome
    async fn relay_session(
        &self,
        client: TcpStream,
        upstream: TcpStream,
        early: Vec<u8>,
        record: Arc<UpstreamRecord>,
        admission: Admission,
        client_id: &str,
        shutdown: CancellationToken,
    ) {
        let started = Instant::now();
        let bytes_up = Arc::new(AtomicU64::new(0));
        let bytes_down = Arc::new(AtomicU64::new(0));

        let (client_read, client_write) = client.into_split();
        let (upstream_read, mut upstream_write) = upstream.into_split();

        if !early.is_empty() {
            if upstream_write.write_all(&early).await.is_err() {
                record.end_session();
                self.settle(&record, client_id, admission, 0, started.elapsed());
                return;
            }
            bytes_up.fetch_add(early.len() as u64, Ordering::Relaxed);
            self.metrics.bytes_up_total.inc_by(early.len() as u64);
            record.add_bytes_sent(early.len() as u64);
        }

        let idle = self.config.idle_timeout;
        let up = pump(client_read, upstream_write, idle, Arc::clone(&bytes_up), |n| {
            self.metrics.bytes_up_total.inc_by(n);
            record.add_bytes_sent(n);
        });
        let down = pump(
            upstream_read,
            client_write,
            idle,
            Arc::clone(&bytes_down),
            |n| {
                self.metrics.bytes_down_total.inc_by(n);
                record.add_bytes_received(n);
            },
        );

        tokio::select! {
            _ = async { tokio::join!(up, down) } => {}
            _ = shutdown.cancelled() => {
                debug!(client_id, upstream = %record.identity(), "session cancelled by shutdown");
            }
        }

        let received = bytes_down.load(Ordering::Relaxed);
        let sent = bytes_up.load(Ordering::Relaxed);
        let elapsed = started.elapsed();
        record.end_session();
        self.settle(&record, client_id, admission, received, elapsed);

        debug!(
            client_id,
            upstream = %record.identity(),
            bytes_up = sent,
            bytes_down = received,
            elapsed_ms = elapsed.as_millis() as u64,
            "session closed"
        );
    }

    /// Translate relay totals into a breaker verdict
    ///
    /// Success requires payload bytes to have flowed back to the client. A
    /// session that died inside the probation window without any counts as
    /// an upstream failure and unpins the client. Anything else is neutral
    /// for normal traffic, but a half-open probe must always leave the
    /// breaker re-decided: a probe that produced nothing counts against
    /// the upstream so the circuit reopens instead of wedging half-open.
    fn settle(
        &self,
        record: &UpstreamRecord,
        client_id: &str,
        admission: Admission,
        received: u64,
        elapsed: Duration,
    ) {
        if received > 0 {
            self.registry.report_result(record.identity(), true);
            return;
        }

        let in_probation = elapsed < record.breaker().config().probation;
        if in_probation || admission == Admission::Probe {
            if in_probation {
                info!(
                    client_id,
                    upstream = %record.identity(),
                    phase = "relay",
                    "session died in probation with no bytes"
                );
            } else {
                info!(
                    client_id,
                    upstream = %record.identity(),
                    phase = "relay",
                    "probe session ended with no bytes, reopening breaker"
                );
            }
            self.registry.report_result(record.identity(), false);
            self.metrics
                .record_upstream_failure(&record.identity().label());
            self.selector.sticky().invalidate(client_id);
        }
    }
}

/// Holds the active-connections gauge up for the lifetime of a session
///
/// Decrements on drop, so the count stays accurate even when a session
/// task is aborted during forced shutdown.
struct ConnectionGauge<'a> {
    gauge: &'a prometheus::IntGauge,
}

impl<'a> ConnectionGauge<'a> {
    fn new(gauge: &'a prometheus::IntGauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for ConnectionGauge<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// One-directional copy loop with an idle-read timeout
///
/// EOF or timeout half-closes the destination so the peer's loop sees a
/// clean end of stream.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    idle: Duration,
    total: Arc<AtomicU64>,
    on_chunk: impl Fn(u64),
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total.fetch_add(n as u64, Ordering::Relaxed);
        on_chunk(n as u64);
    }
    let _ = writer.shutdown().await;
}

/// Write a minimal HTTP/1.1 response and flush it
async fn respond(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    extra_headers: &[(&str, &str)],
    body: &str,
) {
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in extra_headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        403 => "Forbidden",
        407 => "Proxy Authentication Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Upstream Refused",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_phrases() {
        assert_eq!(reason_phrase(502), "Bad Gateway");
        assert_eq!(reason_phrase(504), "Gateway Timeout");
        assert_eq!(reason_phrase(418), "Upstream Refused");
    }

    #[test]
    fn test_config_defaults() {
        let config = TunnelConfig::default();
        assert!(config.enable_auth);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
    }
}
