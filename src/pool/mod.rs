//! Upstream pool: records, circuit breaking, and the snapshot registry
//!
//! This module provides:
//! - Value-identity upstream records with atomic health state
//! - A per-upstream circuit breaker (Closed/Open/HalfOpen)
//! - A registry publishing immutable pool snapshots by atomic swap

pub mod circuit;
pub mod record;
pub mod registry;

pub use circuit::{Admission, Breaker, BreakerConfig, BreakerPhase, BreakerView};
pub use record::{Health, UpstreamIdentity, UpstreamParseError, UpstreamRecord};
pub use registry::{PoolRegistry, PoolSnapshot, ReplaceError};
