//! Rate limiting logic and state management.

mod clock;
mod interval;
mod key;
mod limiter;
mod policy;
mod rules;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use interval::{format_interval, parse_interval};
pub use key::LimiterKey;
pub use limiter::{RateLimit, RateLimiter};
pub use policy::{
    Decision, FixedWindowState, LimiterState, SlidingWindowState, TimeBackoffState,
    TokenBucketState,
};
pub use rules::{
    BackoffParams, BackoffStep, PolicyConfig, RateLimitConfig, RefillRate, RouteConfig,
    TokenBucketParams, WindowParams,
};
pub use store::{LimiterStore, MemoryStore, SnapshotEntry, StoredState};
