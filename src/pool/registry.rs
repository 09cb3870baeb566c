//! Pool registry: owns the current upstream set as an immutable snapshot
//!
//! Snapshots are published by atomic reference swap. Readers copy the
//! reference and work against a frozen view; no selection ever observes a
//! mix of old and new records.

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use super::circuit::BreakerConfig;
use super::record::{UpstreamIdentity, UpstreamRecord};

/// Errors from snapshot replacement
#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("duplicate upstream {0}")]
    Duplicate(UpstreamIdentity),
}

/// An immutable, versioned view of the upstream set
///
/// Records are ordered by (generation, identity) so round-robin rotation
/// is deterministic. The cursor is per-snapshot: a replacement restarts
/// rotation from the front.
#[derive(Debug)]
pub struct PoolSnapshot {
    version: u64,
    records: Vec<Arc<UpstreamRecord>>,
    cursor: AtomicUsize,
}

impl PoolSnapshot {
    fn new(version: u64, mut records: Vec<Arc<UpstreamRecord>>) -> Self {
        records.sort_by(|a, b| {
            a.generation()
                .cmp(&b.generation())
                .then_with(|| a.identity().to_string().cmp(&b.identity().to_string()))
        });
        Self {
            version,
            records,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn records(&self) -> &[Arc<UpstreamRecord>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn find(&self, identity: &UpstreamIdentity) -> Option<&Arc<UpstreamRecord>> {
        self.records.iter().find(|r| r.identity() == identity)
    }

    /// Advance the rotation cursor and return its previous value
    pub fn next_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }
}

/// Owns the current snapshot and the generation counter
pub struct PoolRegistry {
    current: ArcSwap<PoolSnapshot>,
    next_generation: AtomicU64,
    next_version: AtomicU64,
    breaker_config: BreakerConfig,
}

impl PoolRegistry {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(PoolSnapshot::new(0, Vec::new())),
            next_generation: AtomicU64::new(1),
            next_version: AtomicU64::new(1),
            breaker_config,
        }
    }

    /// The current snapshot; cheap, lock-free
    pub fn current(&self) -> Arc<PoolSnapshot> {
        self.current.load_full()
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        self.breaker_config
    }

    /// Atomically publish a new upstream set
    ///
    /// Identities present in the previous snapshot keep their record (and
    /// with it health and breaker state); new identities get fresh records
    /// in Unknown health with fresh generations. Removed records simply
    /// stop being referenced; in-flight sessions holding them complete
    /// but they cannot be reselected.
    pub fn replace(
        &self,
        identities: Vec<UpstreamIdentity>,
    ) -> Result<Arc<PoolSnapshot>, ReplaceError> {
        let mut seen = HashSet::with_capacity(identities.len());
        for identity in &identities {
            if !seen.insert(identity.clone()) {
                return Err(ReplaceError::Duplicate(identity.clone()));
            }
        }

        let previous = self.current.load();
        let mut kept = 0usize;
        let records: Vec<Arc<UpstreamRecord>> = identities
            .into_iter()
            .map(|identity| match previous.find(&identity) {
                Some(existing) => {
                    kept += 1;
                    Arc::clone(existing)
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    debug!(upstream = %identity, generation, "new upstream record");
                    Arc::new(UpstreamRecord::new(
                        identity,
                        generation,
                        self.breaker_config,
                    ))
                }
            })
            .collect();

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let added = records.len() - kept;
        let removed = previous.len() - kept;
        let snapshot = Arc::new(PoolSnapshot::new(version, records));
        self.current.store(Arc::clone(&snapshot));

        info!(
            version,
            size = snapshot.len(),
            added,
            removed,
            "published pool snapshot"
        );
        Ok(snapshot)
    }

    /// Feed a session outcome into the upstream's breaker
    ///
    /// Safe to call from any number of concurrent sessions. Outcomes for
    /// records no longer in the snapshot are dropped.
    pub fn report_result(&self, identity: &UpstreamIdentity, ok: bool) {
        let snapshot = self.current.load();
        if let Some(record) = snapshot.find(identity) {
            if ok {
                record.breaker().record_success();
            } else {
                record.breaker().record_failure(Instant::now());
            }
        }
    }
}
