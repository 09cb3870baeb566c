//! Sticky session map: client identity pinned to an upstream for a TTL
//!
//! Bindings reference upstreams by value identity, never by pointer, so a
//! pool reload can't leave a binding dangling. Eviction is lazy on lookup
//! plus a periodic sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::pool::UpstreamIdentity;

#[derive(Debug, Clone)]
struct StickyBinding {
    identity: UpstreamIdentity,
    expires_at: Instant,
}

/// Client identity -> upstream identity with TTL
///
/// A zero TTL disables stickiness entirely; lookups and writes become
/// no-ops.
#[derive(Debug)]
pub struct StickyMap {
    ttl: Duration,
    bindings: Mutex<HashMap<String, StickyBinding>>,
}

impl StickyMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unexpired binding for a client, evicting it lazily when stale
    pub fn lookup(&self, client_id: &str, now: Instant) -> Option<UpstreamIdentity> {
        if !self.enabled() || client_id.is_empty() {
            return None;
        }
        let mut bindings = self.bindings.lock().expect("sticky lock poisoned");
        match bindings.get(client_id) {
            Some(binding) if now < binding.expires_at => Some(binding.identity.clone()),
            Some(_) => {
                bindings.remove(client_id);
                None
            }
            None => None,
        }
    }

    /// Write or refresh a binding
    pub fn bind(&self, client_id: &str, identity: &UpstreamIdentity, now: Instant) {
        if !self.enabled() || client_id.is_empty() {
            return;
        }
        let mut bindings = self.bindings.lock().expect("sticky lock poisoned");
        bindings.insert(
            client_id.to_string(),
            StickyBinding {
                identity: identity.clone(),
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drop a client's binding so the next selection starts fresh
    pub fn invalidate(&self, client_id: &str) {
        if client_id.is_empty() {
            return;
        }
        let mut bindings = self.bindings.lock().expect("sticky lock poisoned");
        if bindings.remove(client_id).is_some() {
            debug!(client_id, "sticky binding invalidated");
        }
    }

    /// Remove expired bindings; returns how many were dropped
    pub fn sweep(&self, now: Instant) -> usize {
        let mut bindings = self.bindings.lock().expect("sticky lock poisoned");
        let before = bindings.len();
        bindings.retain(|_, binding| now < binding.expires_at);
        before - bindings.len()
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().expect("sticky lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
