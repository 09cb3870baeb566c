//! Minimal HTTP/1.1 request-head handling for the proxy data plane
//!
//! The gateway only ever parses the first request head off a client
//! socket; everything after it is relayed as opaque bytes. The reader is
//! bounded: heads over 8 KiB or 100 headers are rejected.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the request head, request line included
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Upper bound on the number of header lines
pub const MAX_HEADERS: usize = 100;

/// Headers never forwarded to the upstream. The RFC 7230 hop-by-hop set
/// plus our own auth carriers.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "proxy-authorization",
    "proxy-authenticate",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "x-pg-auth",
];

/// Client protocol errors; all map to a 400 response
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("client closed before completing the request head")]
    UnexpectedEof,

    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,

    #[error("request has more than {MAX_HEADERS} headers")]
    TooManyHeaders,

    #[error("malformed request line {0:?}")]
    BadRequestLine(String),

    #[error("malformed header line")]
    BadHeader,

    #[error("unsupported request target {0:?}")]
    BadTarget(String),

    #[error("i/o reading request head: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// The `host:port` authority this request wants to reach
    ///
    /// CONNECT carries it in the request target; plain requests carry an
    /// absolute URI or fall back to the Host header (port 80 implied).
    pub fn authority(&self) -> Result<String, HttpError> {
        if self.is_connect() {
            if self.target.contains(':') && !self.target.contains('/') {
                return Ok(self.target.clone());
            }
            return Err(HttpError::BadTarget(self.target.clone()));
        }

        if let Some(rest) = self.target.strip_prefix("http://") {
            let authority = rest.split('/').next().unwrap_or("");
            // strip userinfo if present
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            if authority.is_empty() {
                return Err(HttpError::BadTarget(self.target.clone()));
            }
            return Ok(with_default_port(authority));
        }

        if self.target.starts_with('/') {
            if let Some(host) = self.header("host") {
                return Ok(with_default_port(host));
            }
        }
        Err(HttpError::BadTarget(self.target.clone()))
    }

    /// Credentials embedded in an absolute-form target's userinfo
    pub fn userinfo(&self) -> Option<String> {
        let rest = self.target.strip_prefix("http://")?;
        let authority = rest.split('/').next()?;
        let at = authority.rfind('@')?;
        Some(authority[..at].to_string())
    }
}

fn with_default_port(authority: &str) -> String {
    if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    }
}

/// Read and parse one request head off the stream
///
/// Returns the head plus any bytes the client sent beyond the header
/// terminator; the caller forwards those verbatim.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(RequestHead, Vec<u8>), HttpError> {
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_terminator(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(HttpError::HeadTooLarge);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::UnexpectedEof);
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    if head_end > MAX_HEAD_BYTES {
        return Err(HttpError::HeadTooLarge);
    }

    let head_bytes = &buffer[..head_end];
    let remainder = buffer[head_end + 4..].to_vec();

    let text = std::str::from_utf8(head_bytes)
        .map_err(|_| HttpError::BadRequestLine(String::new()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) if v.starts_with("HTTP/") => {
            (m.to_string(), t.to_string(), v.to_string())
        }
        _ => return Err(HttpError::BadRequestLine(request_line.to_string())),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(HttpError::TooManyHeaders);
        }
        let (name, value) = line.split_once(':').ok_or(HttpError::BadHeader)?;
        if name.is_empty() || name.contains(' ') {
            return Err(HttpError::BadHeader);
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok((
        RequestHead {
            method,
            target,
            version,
            headers,
        },
        remainder,
    ))
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Rewrite a plain request head for forwarding to an upstream proxy
///
/// The request line becomes absolute-form and hop-by-hop headers are
/// stripped. The result is unterminated: the caller appends the selected
/// upstream's `Proxy-Authorization` (credentials differ per record) and
/// the final blank line.
pub fn build_forward_head(head: &RequestHead) -> Result<String, HttpError> {
    let absolute = if head.target.starts_with("http://") {
        strip_userinfo(&head.target)
    } else if head.target.starts_with('/') {
        let host = head
            .header("host")
            .ok_or_else(|| HttpError::BadTarget(head.target.clone()))?;
        format!("http://{}{}", host, head.target)
    } else {
        return Err(HttpError::BadTarget(head.target.clone()));
    };

    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, absolute);
    for (name, value) in &head.headers {
        if STRIPPED_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n");
    Ok(out)
}

fn strip_userinfo(target: &str) -> String {
    let Some(rest) = target.strip_prefix("http://") else {
        return target.to_string();
    };
    let slash = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..slash];
    match authority.rfind('@') {
        Some(at) => format!("http://{}{}", &authority[at + 1..], &rest[slash..]),
        None => target.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &[u8]) -> Result<(RequestHead, Vec<u8>), HttpError> {
        let mut reader = std::io::Cursor::new(raw.to_vec());
        read_request_head(&mut reader).await
    }

    #[tokio::test]
    async fn test_parse_connect() {
        let (head, rest) = parse(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: curl/8.0\r\n\r\n")
            .await
            .unwrap();
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.authority().unwrap(), "example.com:443");
        assert_eq!(head.header("user-agent"), Some("curl/8.0"));
        assert_eq!(head.header("USER-AGENT"), Some("curl/8.0"));
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_remainder_preserved() {
        let (head, rest) =
            parse(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01early").await.unwrap();
        assert!(head.is_connect());
        assert_eq!(rest, b"\x16\x03\x01early");
    }

    #[tokio::test]
    async fn test_parse_absolute_form() {
        let (head, _) = parse(b"GET http://example.com/path?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        assert!(!head.is_connect());
        assert_eq!(head.authority().unwrap(), "example.com:80");
        assert_eq!(head.userinfo(), None);
    }

    #[tokio::test]
    async fn test_userinfo_extracted() {
        let (head, _) =
            parse(b"GET http://bot1:1700000000:abcd@example.com/ HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
        assert_eq!(head.userinfo().unwrap(), "bot1:1700000000:abcd");
        assert_eq!(head.authority().unwrap(), "example.com:80");
    }

    #[tokio::test]
    async fn test_head_too_large() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 1));
        raw.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(parse(&raw).await, Err(HttpError::HeadTooLarge)));
    }

    #[tokio::test]
    async fn test_too_many_headers() {
        let mut raw = b"GET http://e.com/ HTTP/1.1\r\n".to_vec();
        for i in 0..(MAX_HEADERS + 1) {
            raw.extend_from_slice(format!("X-H{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        assert!(matches!(parse(&raw).await, Err(HttpError::TooManyHeaders)));
    }

    #[tokio::test]
    async fn test_bad_request_line() {
        assert!(matches!(
            parse(b"NONSENSE\r\n\r\n").await,
            Err(HttpError::BadRequestLine(_))
        ));
        assert!(matches!(
            parse(b"GET /x HTTP/1.1 extra\r\n\r\n").await,
            Err(HttpError::BadRequestLine(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_before_terminator() {
        assert!(matches!(
            parse(b"GET / HT").await,
            Err(HttpError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_forward_head_strips_hop_by_hop() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "http://example.com/data".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![
                ("Host".to_string(), "example.com".to_string()),
                ("Proxy-Authorization".to_string(), "Basic abc".to_string()),
                ("Keep-Alive".to_string(), "300".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ],
        };

        let out = build_forward_head(&head).unwrap();
        assert!(out.starts_with("GET http://example.com/data HTTP/1.1\r\n"));
        assert!(out.contains("Host: example.com\r\n"));
        assert!(out.contains("Accept: */*\r\n"));
        assert!(!out.contains("Basic abc"));
        assert!(!out.contains("Keep-Alive"));
        // unterminated: the caller appends upstream auth and the blank line
        assert!(out.ends_with("Connection: close\r\n"));
        assert!(!out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_forward_head_rewrites_origin_form() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "/data".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), "example.com".to_string())],
        };
        let out = build_forward_head(&head).unwrap();
        assert!(out.starts_with("GET http://example.com/data HTTP/1.1\r\n"));
    }

    #[test]
    fn test_forward_head_drops_userinfo() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "http://bot1:1:ab@example.com/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![],
        };
        let out = build_forward_head(&head).unwrap();
        assert!(out.starts_with("GET http://example.com/ HTTP/1.1\r\n"));
    }
}
