//! Dialing upstream proxies and the CONNECT handshake

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::pool::UpstreamRecord;

/// Upper bound on the upstream's handshake response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Failures talking to an upstream proxy; all feed the breaker
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("dial timed out")]
    DialTimeout,

    #[error("dial failed: {0}")]
    Dial(std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake i/o: {0}")]
    HandshakeIo(std::io::Error),

    #[error("upstream closed during handshake")]
    ClosedEarly,

    #[error("handshake response head too large")]
    OversizedResponse,

    #[error("malformed handshake response")]
    MalformedResponse,

    #[error("upstream refused with status {status}")]
    Refused { status: u16 },
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            UpstreamError::DialTimeout | UpstreamError::HandshakeTimeout
        )
    }

    /// Status code already issued by the upstream, if any
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            UpstreamError::Refused { status } => Some(*status),
            _ => None,
        }
    }
}

/// Enable TCP_NODELAY and keepalive on a freshly opened socket
pub fn set_fast_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let _ = socket2::SockRef::from(stream).set_keepalive(true);
}

/// Dial a plain TCP connection to the upstream proxy
pub async fn dial(record: &UpstreamRecord, connect_timeout: Duration) -> Result<TcpStream, UpstreamError> {
    let addr = record.identity().dial_addr();
    let stream = timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| UpstreamError::DialTimeout)?
        .map_err(UpstreamError::Dial)?;
    set_fast_socket(&stream);
    Ok(stream)
}

/// Dial the upstream proxy and establish a CONNECT tunnel to `target`
///
/// On success the returned stream is an open tunnel: the upstream answered
/// 2xx and everything from here on is opaque payload.
pub async fn connect_through(
    record: &UpstreamRecord,
    target: &str,
    user_agent: Option<&str>,
    connect_timeout: Duration,
) -> Result<TcpStream, UpstreamError> {
    let mut stream = dial(record, connect_timeout).await?;

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(ua) = user_agent {
        request.push_str("User-Agent: ");
        request.push_str(ua);
        request.push_str("\r\n");
    }
    request.push_str("Proxy-Connection: Keep-Alive\r\n");
    if let Some(payload) = record.auth_payload() {
        request.push_str("Proxy-Authorization: Basic ");
        request.push_str(payload);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    timeout(connect_timeout, async {
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(UpstreamError::HandshakeIo)?;
        read_handshake_status(&mut stream).await
    })
    .await
    .map_err(|_| UpstreamError::HandshakeTimeout)??;

    Ok(stream)
}

/// Read the upstream's response head and require a 2xx status
async fn read_handshake_status(stream: &mut TcpStream) -> Result<(), UpstreamError> {
    let mut response: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 4096];

    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        if response.len() > MAX_RESPONSE_HEAD {
            return Err(UpstreamError::OversizedResponse);
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(UpstreamError::HandshakeIo)?;
        if n == 0 {
            return Err(UpstreamError::ClosedEarly);
        }
        response.extend_from_slice(&chunk[..n]);
    }

    let first_line = response
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or(&[]);
    let status = parse_status_line(first_line).ok_or(UpstreamError::MalformedResponse)?;

    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(UpstreamError::Refused { status })
    }
}

fn parse_status_line(line: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(line).ok()?;
    if !text.starts_with("HTTP/") {
        return None;
    }
    text.split_whitespace().nth(1)?.parse().ok()
}
