//! Gateway configuration loaded from environment variables

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors are fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{name} must not be empty")]
    Empty { name: &'static str },
}

fn default_secret() -> String {
    "dev-secret-do-not-use-in-prod".to_string()
}

/// Main configuration structure
///
/// All values come from environment variables with the `PG_` prefix
/// (the two ports keep their legacy unprefixed names). The HMAC secret
/// is excluded from serialized status output.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// HMAC key for client token verification
    #[serde(skip_serializing)]
    pub secret: String,

    /// When false, bypass client authentication entirely
    pub enable_auth: bool,

    /// Hot-reloaded upstream list file
    pub proxy_file: PathBuf,

    /// Upstream URLs seeded from the environment; these persist across
    /// file reloads
    pub proxy_list: Vec<String>,

    /// Sticky-binding lifetime in seconds; 0 disables stickiness
    pub sticky_ttl_secs: u64,

    /// Client-facing listener port
    pub proxy_port: u16,

    /// Metrics/status listener port
    pub metrics_port: u16,

    /// Upstream dial + CONNECT handshake timeout in seconds
    pub connect_timeout_secs: u64,

    /// Health prober period in seconds
    pub health_check_interval_secs: u64,

    /// CONNECT target used by the health prober
    pub health_canary: String,

    /// Per-direction relay idle-read timeout in seconds
    pub idle_timeout_secs: u64,
}

impl Config {
    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            enable_auth: true,
            proxy_file: PathBuf::from("proxies.txt"),
            proxy_list: Vec::new(),
            sticky_ttl_secs: 0,
            proxy_port: 8888,
            metrics_port: 9090,
            connect_timeout_secs: 10,
            health_check_interval_secs: 30,
            health_canary: "www.google.com:443".to_string(),
            idle_timeout_secs: 120,
        }
    }
}

fn env_var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name,
                value: raw,
                reason: e.to_string(),
            }),
    }
}

/// Load configuration from environment variables
///
/// Tries to load a `.env` file first (don't fail if it doesn't exist).
pub fn load_from_env() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    if let Some(secret) = env_var("PG_SECRET") {
        config.secret = secret;
    }
    if config.secret.is_empty() {
        return Err(ConfigError::Empty { name: "PG_SECRET" });
    }

    if let Some(raw) = env_var("PG_ENABLE_AUTH") {
        config.enable_auth = raw.trim().eq_ignore_ascii_case("true");
    }

    if let Some(file) = env_var("PG_PROXY_FILE") {
        config.proxy_file = PathBuf::from(file);
    }

    if let Some(list) = env_var("PG_PROXY_LIST") {
        config.proxy_list = list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    if let Some(v) = parse_env::<u64>("PG_STICKY_TTL")? {
        config.sticky_ttl_secs = v;
    }
    if let Some(v) = parse_env::<u16>("PROXY_PORT")? {
        config.proxy_port = v;
    }
    if let Some(v) = parse_env::<u16>("METRICS_PORT")? {
        config.metrics_port = v;
    }
    if let Some(v) = parse_env::<u64>("PG_CONNECT_TIMEOUT")? {
        config.connect_timeout_secs = v;
    }
    if let Some(v) = parse_env::<u64>("PG_HEALTH_CHECK_INTERVAL")? {
        config.health_check_interval_secs = v;
    }
    if let Some(canary) = env_var("PG_HEALTH_CANARY") {
        if !canary.contains(':') {
            return Err(ConfigError::InvalidValue {
                name: "PG_HEALTH_CANARY",
                value: canary,
                reason: "expected host:port".to_string(),
            });
        }
        config.health_canary = canary;
    }
    if let Some(v) = parse_env::<u64>("PG_IDLE_TIMEOUT")? {
        config.idle_timeout_secs = v;
    }

    if config.connect_timeout_secs == 0 {
        return Err(ConfigError::InvalidValue {
            name: "PG_CONNECT_TIMEOUT",
            value: "0".to_string(),
            reason: "timeout must be positive".to_string(),
        });
    }

    Ok(config)
}
