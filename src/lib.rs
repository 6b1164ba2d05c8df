//! Ratewarden - Per-route Rate Limiting
//!
//! This crate decides whether a client may call a named route. Each route is
//! configured in YAML with one of four policies: fixed window, sliding window,
//! token bucket, or time backoff, where throttling escalates with the number
//! of attempts. Call sites ask `RateLimiter::ensure_accepted(route, client)`
//! and propagate the `LimitExceeded` error, or clear a caller's state with
//! `RateLimiter::reset(route, client)`.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod telemetry;
