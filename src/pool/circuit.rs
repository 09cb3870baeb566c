//! Per-upstream circuit breaker
//!
//! Three states:
//! - Closed: normal operation, consecutive failures counted
//! - Open: upstream removed from selection until the cooldown elapses
//! - HalfOpen: a single probe session is admitted to test recovery
//!
//! The state sits behind a plain mutex; critical sections are a few loads
//! and stores and the lock is never held across I/O.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// How long an open circuit rejects before admitting a probe
    pub open_duration: Duration,

    /// Concurrent probe sessions admitted while half-open
    pub halfopen_max_inflight: u32,

    /// Sessions that die within this window with no payload bytes count
    /// as failures
    pub probation: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            halfopen_max_inflight: 1,
            probation: Duration::from_secs(2),
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerPhase {
    pub fn name(self) -> &'static str {
        match self {
            BreakerPhase::Closed => "closed",
            BreakerPhase::Open => "open",
            BreakerPhase::HalfOpen => "half_open",
        }
    }
}

/// How a selection was admitted through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, normal traffic
    Normal,
    /// Half-open probe slot claimed; the outcome decides the circuit
    Probe,
}

#[derive(Debug)]
struct BreakerInner {
    phase: BreakerPhase,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    halfopen_inflight: u32,
}

/// Point-in-time view for status reporting and selection ordering
#[derive(Debug, Clone, Copy)]
pub struct BreakerView {
    pub phase: BreakerPhase,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct Breaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                opened_at: None,
                halfopen_inflight: 0,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current phase, promoting Open to HalfOpen once the cooldown elapsed
    pub fn view(&self, now: Instant) -> BreakerView {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.promote_if_elapsed(&mut inner, now);
        BreakerView {
            phase: inner.phase,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    /// Ask the breaker to admit a session at `now`
    ///
    /// Returns None when the circuit rejects (Open and still cooling down,
    /// or HalfOpen with its probe slot taken).
    pub fn try_admit(&self, now: Instant) -> Option<Admission> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.promote_if_elapsed(&mut inner, now);

        match inner.phase {
            BreakerPhase::Closed => Some(Admission::Normal),
            BreakerPhase::Open => None,
            BreakerPhase::HalfOpen => {
                if inner.halfopen_inflight < self.config.halfopen_max_inflight {
                    inner.halfopen_inflight += 1;
                    Some(Admission::Probe)
                } else {
                    None
                }
            }
        }
    }

    /// Record a successful session
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        match inner.phase {
            BreakerPhase::Closed => {}
            BreakerPhase::HalfOpen => {
                debug!("breaker closing after successful probe");
                inner.phase = BreakerPhase::Closed;
                inner.opened_at = None;
                inner.halfopen_inflight = 0;
            }
            BreakerPhase::Open => {
                // a straggler from before the trip finished well; the
                // cooldown still applies
            }
        }
    }

    /// Record a failed session
    pub fn record_failure(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.phase {
            BreakerPhase::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "breaker tripped open"
                    );
                    inner.phase = BreakerPhase::Open;
                    inner.opened_at = Some(now);
                    inner.halfopen_inflight = 0;
                }
            }
            BreakerPhase::HalfOpen => {
                warn!("probe failed, breaker reopening");
                inner.phase = BreakerPhase::Open;
                inner.opened_at = Some(now);
                inner.halfopen_inflight = 0;
            }
            BreakerPhase::Open => {
                // stragglers don't refresh the cooldown
            }
        }
    }

    /// Give back a claimed probe slot without recording a verdict
    ///
    /// For probe sessions that abort before the upstream had any chance
    /// to prove itself (client vanished, shutdown). The phase is
    /// unchanged; the next selection may probe again.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.phase == BreakerPhase::HalfOpen {
            inner.halfopen_inflight = inner.halfopen_inflight.saturating_sub(1);
        }
    }

    /// Whether the circuit currently rejects traffic
    pub fn is_open(&self, now: Instant) -> bool {
        self.view(now).phase == BreakerPhase::Open
    }

    fn promote_if_elapsed(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.phase == BreakerPhase::Open {
            if let Some(opened_at) = inner.opened_at {
                if now.duration_since(opened_at) >= self.config.open_duration {
                    debug!("breaker entering half-open");
                    inner.phase = BreakerPhase::HalfOpen;
                    inner.halfopen_inflight = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_millis(100),
            halfopen_max_inflight: 1,
            probation: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_closed_to_open() {
        let breaker = Breaker::new(test_config());
        let now = Instant::now();

        assert_eq!(breaker.try_admit(now), Some(Admission::Normal));

        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.view(now).phase, BreakerPhase::Closed);

        breaker.record_failure(now);
        assert_eq!(breaker.view(now).phase, BreakerPhase::Open);
        assert_eq!(breaker.try_admit(now), None);
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = Breaker::new(test_config());
        let now = Instant::now();

        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        breaker.record_failure(now);

        // never reached threshold consecutively
        assert_eq!(breaker.view(now).phase, BreakerPhase::Closed);
    }

    #[test]
    fn test_open_to_halfopen_single_probe() {
        let breaker = Breaker::new(test_config());
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(t0);
        }
        assert_eq!(breaker.try_admit(t0), None);

        // cooldown elapsed: exactly one probe gets through
        let t1 = t0 + Duration::from_millis(150);
        assert_eq!(breaker.try_admit(t1), Some(Admission::Probe));
        assert_eq!(breaker.try_admit(t1), None);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = Breaker::new(test_config());
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(t0);
        }
        let t1 = t0 + Duration::from_millis(150);
        assert_eq!(breaker.try_admit(t1), Some(Admission::Probe));

        breaker.record_failure(t1);
        assert_eq!(breaker.view(t1).phase, BreakerPhase::Open);
        // opened_at was refreshed, so the old deadline no longer applies
        assert_eq!(breaker.try_admit(t1 + Duration::from_millis(50)), None);
        assert_eq!(
            breaker.try_admit(t1 + Duration::from_millis(150)),
            Some(Admission::Probe)
        );
    }

    #[test]
    fn test_released_probe_slot_can_be_reclaimed() {
        let breaker = Breaker::new(test_config());
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(t0);
        }
        let t1 = t0 + Duration::from_millis(150);
        assert_eq!(breaker.try_admit(t1), Some(Admission::Probe));
        assert_eq!(breaker.try_admit(t1), None);

        // an aborted probe must not wedge the circuit half-open
        breaker.release_probe();
        assert_eq!(breaker.view(t1).phase, BreakerPhase::HalfOpen);
        assert_eq!(breaker.try_admit(t1), Some(Admission::Probe));
    }

    #[test]
    fn test_release_probe_noop_when_closed() {
        let breaker = Breaker::new(test_config());
        breaker.release_probe();
        assert_eq!(breaker.try_admit(Instant::now()), Some(Admission::Normal));
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = Breaker::new(test_config());
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(t0);
        }
        let t1 = t0 + Duration::from_millis(150);
        assert_eq!(breaker.try_admit(t1), Some(Admission::Probe));

        breaker.record_success();
        assert_eq!(breaker.view(t1).phase, BreakerPhase::Closed);
        assert_eq!(breaker.try_admit(t1), Some(Admission::Normal));
    }
}
