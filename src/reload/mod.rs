//! Hot reload of the upstream list from the proxy file
//!
//! A single periodic task polls the file's mtime (stat only); on change it
//! re-reads the whole file, parses and validates every line, and submits
//! the new set to the registry as one atomic replacement. Any parse error
//! aborts the reload and leaves the current snapshot untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::GatewayMetrics;
use crate::pool::{PoolRegistry, ReplaceError, UpstreamIdentity, UpstreamParseError};

/// Default stat-poll period
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: UpstreamParseError,
    },

    #[error(transparent)]
    Replace(#[from] ReplaceError),
}

/// Parse proxy-file content: one URL per line, `#` comments, blanks
/// ignored, duplicates collapsed to their first occurrence
pub fn parse_proxy_lines(content: &str) -> Result<Vec<UpstreamIdentity>, ReloadError> {
    let mut identities = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let identity = UpstreamIdentity::parse(line).map_err(|source| ReloadError::Parse {
            line: index + 1,
            source,
        })?;
        if !identities.contains(&identity) {
            identities.push(identity);
        }
    }
    Ok(identities)
}

/// Merge the environment-seeded upstreams behind the file's entries,
/// skipping any already present
pub fn merge_env_seed(
    mut identities: Vec<UpstreamIdentity>,
    env_seed: &[UpstreamIdentity],
) -> Vec<UpstreamIdentity> {
    for identity in env_seed {
        if !identities.contains(identity) {
            identities.push(identity.clone());
        }
    }
    identities
}

/// Watches the proxy file and republishes the pool on change
pub struct ReloadWatcher {
    path: PathBuf,
    env_seed: Vec<UpstreamIdentity>,
    registry: Arc<PoolRegistry>,
    metrics: Arc<GatewayMetrics>,
    poll_interval: Duration,
}

impl ReloadWatcher {
    pub fn new(
        path: PathBuf,
        env_seed: Vec<UpstreamIdentity>,
        registry: Arc<PoolRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            path,
            env_seed,
            registry,
            metrics,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Start the polling loop; runs until cancelled
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(path = %self.path.display(), "reload watcher started");
            let mut last_mtime = file_mtime(&self.path).await;

            loop {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    _ = shutdown.cancelled() => {
                        info!("reload watcher stopping");
                        return;
                    }
                }

                let mtime = file_mtime(&self.path).await;
                let changed = match (mtime, last_mtime) {
                    (Some(current), Some(previous)) => current > previous,
                    (Some(_), None) => true,
                    _ => false,
                };
                if !changed {
                    continue;
                }
                last_mtime = mtime;
                self.reload_now().await;
            }
        })
    }

    /// Read, parse and atomically publish the file's upstream set
    pub async fn reload_now(&self) {
        match self.try_reload().await {
            Ok(size) => {
                info!(path = %self.path.display(), size, "reloaded proxy file");
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "reload aborted, keeping current pool");
                self.metrics.reload_errors_total.inc();
            }
        }
    }

    async fn try_reload(&self) -> Result<usize, ReloadError> {
        let content =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| ReloadError::Io {
                    path: self.path.clone(),
                    source,
                })?;

        let identities = merge_env_seed(parse_proxy_lines(&content)?, &self.env_seed);
        let snapshot = self.registry.replace(identities)?;
        self.metrics.observe_pool(&snapshot);
        Ok(snapshot.len())
    }
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.modified().ok(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "proxy file not readable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BreakerConfig;

    fn identity(host: &str) -> UpstreamIdentity {
        UpstreamIdentity::parse(&format!("http://{host}:8080")).unwrap()
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let content = "\
# primary data center
http://a.example.com:8080

http://user:pw@b.example.com:3128
  # indented comment
http://c.example.com:8080
";
        let identities = parse_proxy_lines(content).unwrap();
        assert_eq!(identities.len(), 3);
        assert_eq!(identities[0].host, "a.example.com");
        assert_eq!(identities[1].username.as_deref(), Some("user"));
    }

    #[test]
    fn test_parse_collapses_duplicates() {
        let content = "http://a.example.com:8080\nhttp://a.example.com:8080\n";
        let identities = parse_proxy_lines(content).unwrap();
        assert_eq!(identities.len(), 1);
    }

    #[test]
    fn test_parse_error_carries_line_number() {
        let content = "http://a.example.com:8080\nnot a url\n";
        let err = parse_proxy_lines(content).unwrap_err();
        match err {
            ReloadError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_merge_env_seed() {
        let from_file = vec![identity("a"), identity("b")];
        let seed = vec![identity("b"), identity("c")];
        let merged = merge_env_seed(from_file, &seed);
        let hosts: Vec<&str> = merged.iter().map(|i| i.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_reload_now_replaces_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        std::fs::write(&path, "http://a.example.com:8080\nhttp://b.example.com:8080\n").unwrap();

        let registry = Arc::new(PoolRegistry::new(BreakerConfig::default()));
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let watcher = ReloadWatcher::new(
            path.clone(),
            Vec::new(),
            Arc::clone(&registry),
            Arc::clone(&metrics),
        );

        watcher.reload_now().await;
        assert_eq!(registry.current().len(), 2);
        assert_eq!(metrics.pool_size.get(), 2);

        // a parse error leaves the pool untouched
        std::fs::write(&path, "http://c.example.com:8080\ngarbage\n").unwrap();
        watcher.reload_now().await;
        assert_eq!(registry.current().len(), 2);
        assert!(registry.current().find(&identity("a.example.com")).is_some());
        assert_eq!(metrics.reload_errors_total.get(), 1);

        // a clean file goes through
        std::fs::write(&path, "http://b.example.com:8080\nhttp://c.example.com:8080\n").unwrap();
        watcher.reload_now().await;
        let snapshot = registry.current();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.find(&identity("a.example.com")).is_none());
        assert!(snapshot.find(&identity("c.example.com")).is_some());
    }
}
