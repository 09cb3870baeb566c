//! proxy-guard - rotating HTTP proxy gateway
//!
//! Accepts client proxy requests (CONNECT for TLS tunneling, forward-proxy
//! semantics for plain HTTP), authenticates them with a time-bound HMAC
//! token, selects an upstream proxy from a managed pool and relays the
//! traffic through it. The pool is health-probed, circuit-broken and
//! hot-reloaded from a file.

pub mod auth;
pub mod config;
pub mod core;
pub mod lb;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod reload;

pub use config::Config;
pub use core::Core;
