//! HMAC-based client authentication
//!
//! Clients present a token of the form `client_id:timestamp:signature`
//! where `signature` is the lowercase-hex HMAC-SHA256 of
//! `client_id || timestamp` under the shared secret. The timestamp is
//! decimal Unix seconds and must fall within the skew window.
//!
//! The token travels in `Proxy-Authorization: Basic <b64>`, in a raw
//! `x-pg-auth` header, or in the userinfo of an absolute-form request URI.

use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the client clock and ours
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Authentication failures; all map to a 407 response
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credentials missing")]
    MissingCredentials,

    #[error("malformed token")]
    Malformed,

    #[error("non-numeric timestamp for client {client_id}")]
    BadTimestamp { client_id: String },

    #[error("timestamp outside skew window for client {client_id}")]
    Expired { client_id: String },

    #[error("signature mismatch for client {client_id}")]
    SignatureMismatch { client_id: String },
}

impl AuthError {
    /// Client id recovered from the token, if parsing got that far
    pub fn client_id(&self) -> Option<&str> {
        match self {
            AuthError::BadTimestamp { client_id }
            | AuthError::Expired { client_id }
            | AuthError::SignatureMismatch { client_id } => Some(client_id),
            _ => None,
        }
    }
}

/// Verifies client tokens against the shared secret
#[derive(Clone)]
pub struct Authenticator {
    key: Vec<u8>,
    skew: Duration,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            skew: DEFAULT_CLOCK_SKEW,
        }
    }

    pub fn with_skew(secret: &str, skew: Duration) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            skew,
        }
    }

    /// Compute the lowercase-hex signature for a client id and timestamp
    pub fn sign(&self, client_id: &str, timestamp: u64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(client_id.as_bytes());
        mac.update(timestamp.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build a complete `client_id:timestamp:signature` token
    pub fn token(&self, client_id: &str, timestamp: u64) -> String {
        format!(
            "{}:{}:{}",
            client_id,
            timestamp,
            self.sign(client_id, timestamp)
        )
    }

    /// Verify a token against the current wall clock
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        self.verify_at(token, now)
    }

    /// Verify a token against an explicit clock reading
    pub fn verify_at(&self, token: &str, now_unix: u64) -> Result<String, AuthError> {
        let mut parts = token.splitn(3, ':');
        let (client_id, ts_raw, sig_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(cid), Some(ts), Some(sig)) if !cid.is_empty() => (cid, ts, sig),
            _ => return Err(AuthError::Malformed),
        };

        let timestamp: u64 = ts_raw.parse().map_err(|_| AuthError::BadTimestamp {
            client_id: client_id.to_string(),
        })?;

        let skew = self.skew.as_secs();
        if now_unix.abs_diff(timestamp) > skew {
            return Err(AuthError::Expired {
                client_id: client_id.to_string(),
            });
        }

        let sig = hex::decode(sig_hex).map_err(|_| AuthError::SignatureMismatch {
            client_id: client_id.to_string(),
        })?;

        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(client_id.as_bytes());
        mac.update(ts_raw.as_bytes());

        // verify_slice is a constant-time comparison
        mac.verify_slice(&sig)
            .map_err(|_| AuthError::SignatureMismatch {
                client_id: client_id.to_string(),
            })?;

        Ok(client_id.to_string())
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}

/// Decode the value of a `Proxy-Authorization` header into the raw token
///
/// Accepts `Basic <b64(client_id:timestamp:signature)>`; returns None for
/// other schemes or undecodable payloads.
pub fn decode_basic_authorization(header_value: &str) -> Option<String> {
    let rest = header_value.trim();
    let payload = rest
        .strip_prefix("Basic ")
        .or_else(|| rest.strip_prefix("basic "))?
        .trim();
    let decoded = Base64.decode(payload).ok()?;
    String::from_utf8(decoded).ok()
}

/// Encode a token as a `Proxy-Authorization` header value
pub fn encode_basic_authorization(token: &str) -> String {
    format!("Basic {}", Base64.encode(token.as_bytes()))
}
