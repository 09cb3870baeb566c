//! Upstream selection: eligibility, rotation, stickiness and health probing
//!
//! # Components
//!
//! - [`Selector`]: chooses an upstream for a request, honoring sticky
//!   bindings, health state and breaker admission
//! - [`StickyMap`]: client identity -> upstream binding with TTL eviction
//! - [`HealthProber`]: periodic CONNECT probes against a canary target
//!
//! Selection is deterministic: eligible records rotate in (generation,
//! identity) order via the snapshot's atomic cursor, and a half-open
//! breaker gets a single probe slot ahead of the rotation.

pub mod health;
pub mod selector;
pub mod sticky;

pub use health::{HealthProber, ProbeConfig};
pub use selector::{SelectError, Selection, Selector};
pub use sticky::StickyMap;
