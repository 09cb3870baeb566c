//! Upstream selection
//!
//! Order of precedence: an unexpired sticky binding whose upstream is still
//! present and eligible, then round-robin over the eligible records using
//! the snapshot's atomic cursor. A half-open breaker gets its single probe
//! slot ahead of the rotation (oldest trip first) so recovery is tested as
//! soon as the cooldown allows.

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};

use crate::lb::StickyMap;
use crate::pool::{Admission, BreakerPhase, PoolRegistry, UpstreamIdentity, UpstreamRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no upstream available")]
    NoUpstreamAvailable,
}

/// A selected upstream plus how its breaker admitted the session
#[derive(Debug, Clone)]
pub struct Selection {
    pub record: Arc<UpstreamRecord>,
    pub admission: Admission,
}

pub struct Selector {
    registry: Arc<PoolRegistry>,
    sticky: Arc<StickyMap>,
}

impl Selector {
    pub fn new(registry: Arc<PoolRegistry>, sticky: Arc<StickyMap>) -> Self {
        Self { registry, sticky }
    }

    pub fn sticky(&self) -> &StickyMap {
        &self.sticky
    }

    /// Select an upstream for a client
    pub fn select(&self, client_id: &str) -> Result<Selection, SelectError> {
        self.select_excluding(client_id, &[])
    }

    /// Select an upstream, skipping identities already tried this session
    pub fn select_excluding(
        &self,
        client_id: &str,
        exclude: &[UpstreamIdentity],
    ) -> Result<Selection, SelectError> {
        let snapshot = self.registry.current();
        let now = Instant::now();

        // sticky hit wins if the bound upstream is still viable
        if let Some(bound) = self.sticky.lookup(client_id, now) {
            if !exclude.contains(&bound) {
                if let Some(record) = snapshot.find(&bound) {
                    if record.health_selectable() {
                        if let Some(admission) = record.breaker().try_admit(now) {
                            trace!(client_id, upstream = %bound, "sticky selection");
                            self.sticky.bind(client_id, &bound, now);
                            return Ok(Selection {
                                record: Arc::clone(record),
                                admission,
                            });
                        }
                    }
                }
            }
            // bound upstream gone, unhealthy or rejected: re-select
            self.sticky.invalidate(client_id);
        }

        let eligible: Vec<&Arc<UpstreamRecord>> = snapshot
            .records()
            .iter()
            .filter(|r| r.health_selectable() && !exclude.contains(r.identity()))
            .collect();

        if eligible.is_empty() {
            return Err(SelectError::NoUpstreamAvailable);
        }

        // a recovering upstream gets its probe ahead of the rotation;
        // oldest trip first, and only one per probe window
        let mut half_open: Vec<(&Arc<UpstreamRecord>, Instant)> = eligible
            .iter()
            .filter_map(|r| {
                let view = r.breaker().view(now);
                if view.phase == BreakerPhase::HalfOpen {
                    Some((*r, view.opened_at.unwrap_or(now)))
                } else {
                    None
                }
            })
            .collect();
        half_open.sort_by_key(|(_, opened_at)| *opened_at);

        if let Some((record, _)) = half_open.first() {
            if let Some(admission) = record.breaker().try_admit(now) {
                debug!(upstream = %record.identity(), "probing half-open upstream");
                self.finish(client_id, record, now);
                return Ok(Selection {
                    record: Arc::clone(record),
                    admission,
                });
            }
        }

        // rotation over the records whose circuit is closed
        let closed: Vec<&Arc<UpstreamRecord>> = eligible
            .iter()
            .copied()
            .filter(|r| r.breaker().view(now).phase == BreakerPhase::Closed)
            .collect();

        if closed.is_empty() {
            return Err(SelectError::NoUpstreamAvailable);
        }

        let start = snapshot.next_cursor() % closed.len();
        for offset in 0..closed.len() {
            let record = closed[(start + offset) % closed.len()];
            if let Some(admission) = record.breaker().try_admit(now) {
                trace!(client_id, upstream = %record.identity(), "rotation selection");
                self.finish(client_id, record, now);
                return Ok(Selection {
                    record: Arc::clone(record),
                    admission,
                });
            }
        }

        Err(SelectError::NoUpstreamAvailable)
    }

    fn finish(&self, client_id: &str, record: &Arc<UpstreamRecord>, now: Instant) {
        self.sticky.bind(client_id, record.identity(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BreakerConfig, Health};
    use std::time::Duration;

    fn identity(host: &str) -> UpstreamIdentity {
        UpstreamIdentity::parse(&format!("http://{host}:8080")).unwrap()
    }

    fn setup(hosts: &[&str], ttl: Duration, config: BreakerConfig) -> (Arc<PoolRegistry>, Selector) {
        let registry = Arc::new(PoolRegistry::new(config));
        registry
            .replace(hosts.iter().map(|h| identity(h)).collect())
            .unwrap();
        let sticky = Arc::new(StickyMap::new(ttl));
        let selector = Selector::new(Arc::clone(&registry), sticky);
        (registry, selector)
    }

    fn host_of(selection: &Selection) -> String {
        selection.record.identity().host.clone()
    }

    #[test]
    fn test_rotation() {
        let (_registry, selector) =
            setup(&["a", "b", "c"], Duration::ZERO, BreakerConfig::default());

        assert_eq!(host_of(&selector.select("").unwrap()), "a");
        assert_eq!(host_of(&selector.select("").unwrap()), "b");
        assert_eq!(host_of(&selector.select("").unwrap()), "c");
        assert_eq!(host_of(&selector.select("").unwrap()), "a");
    }

    #[test]
    fn test_empty_pool_fails_fast() {
        let (_registry, selector) = setup(&[], Duration::ZERO, BreakerConfig::default());
        assert_eq!(
            selector.select("bot1").unwrap_err(),
            SelectError::NoUpstreamAvailable
        );
    }

    #[test]
    fn test_unhealthy_records_skipped() {
        let (registry, selector) =
            setup(&["a", "b"], Duration::ZERO, BreakerConfig::default());

        let snapshot = registry.current();
        snapshot.find(&identity("a")).unwrap().set_health(Health::Unhealthy);

        for _ in 0..4 {
            assert_eq!(host_of(&selector.select("").unwrap()), "b");
        }
    }

    #[test]
    fn test_stickiness_within_ttl() {
        let (_registry, selector) = setup(
            &["a", "b", "c"],
            Duration::from_secs(60),
            BreakerConfig::default(),
        );

        let first = host_of(&selector.select("bot1").unwrap());
        for _ in 0..5 {
            assert_eq!(host_of(&selector.select("bot1").unwrap()), first);
        }
    }

    #[test]
    fn test_sticky_rebinds_when_upstream_unhealthy() {
        let (registry, selector) = setup(
            &["a", "b", "c"],
            Duration::from_secs(60),
            BreakerConfig::default(),
        );

        let first = host_of(&selector.select("bot1").unwrap());
        registry
            .current()
            .find(&identity(&first))
            .unwrap()
            .set_health(Health::Unhealthy);

        let second = host_of(&selector.select("bot1").unwrap());
        assert_ne!(second, first);
        // and the new binding sticks
        assert_eq!(host_of(&selector.select("bot1").unwrap()), second);
    }

    #[test]
    fn test_open_breaker_excluded_until_cooldown() {
        let config = BreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_millis(100),
            ..BreakerConfig::default()
        };
        let (registry, selector) = setup(&["a", "b"], Duration::ZERO, config);

        for _ in 0..3 {
            registry.report_result(&identity("a"), false);
        }

        // a's circuit is open: only b is returned
        for _ in 0..4 {
            assert_eq!(host_of(&selector.select("").unwrap()), "b");
        }

        std::thread::sleep(Duration::from_millis(150));

        // cooldown elapsed: the next selection probes a
        let probe = selector.select("").unwrap();
        assert_eq!(host_of(&probe), "a");
        assert_eq!(probe.admission, Admission::Probe);

        // the probe slot is taken; other selections go to b
        assert_eq!(host_of(&selector.select("").unwrap()), "b");

        // probe failure reopens a
        registry.report_result(&identity("a"), false);
        for _ in 0..3 {
            assert_eq!(host_of(&selector.select("").unwrap()), "b");
        }

        std::thread::sleep(Duration::from_millis(150));

        // probe success closes the circuit; a rejoins the rotation
        let probe = selector.select("").unwrap();
        assert_eq!(host_of(&probe), "a");
        registry.report_result(&identity("a"), true);

        let hosts: Vec<String> = (0..4).map(|_| host_of(&selector.select("").unwrap())).collect();
        assert!(hosts.contains(&"a".to_string()));
        assert!(hosts.contains(&"b".to_string()));
    }

    #[test]
    fn test_exclusion_list() {
        let (_registry, selector) =
            setup(&["a", "b", "c"], Duration::ZERO, BreakerConfig::default());

        let excluded = vec![identity("a"), identity("b")];
        for _ in 0..3 {
            let selection = selector.select_excluding("", &excluded).unwrap();
            assert_eq!(host_of(&selection), "c");
        }

        let all = vec![identity("a"), identity("b"), identity("c")];
        assert_eq!(
            selector.select_excluding("", &all).unwrap_err(),
            SelectError::NoUpstreamAvailable
        );
    }

    #[test]
    fn test_all_breakers_open_fails() {
        let config = BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(30),
            ..BreakerConfig::default()
        };
        let (registry, selector) = setup(&["a", "b"], Duration::ZERO, config);

        registry.report_result(&identity("a"), false);
        registry.report_result(&identity("b"), false);

        assert_eq!(
            selector.select("").unwrap_err(),
            SelectError::NoUpstreamAvailable
        );
    }
}
