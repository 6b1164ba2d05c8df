//! Core rate limiter implementation.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace};

use super::clock::{until, Clock, SystemClock};
use super::key::LimiterKey;
use super::policy::{Decision, LimiterState};
use super::rules::{RateLimitConfig, RouteConfig};
use super::store::{LimiterStore, MemoryStore, StoredState};
use crate::error::{Result, WardenError};

/// The outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Route the check ran against
    pub route: String,
    /// Client key the check ran for
    pub client: String,
    /// Whether the request was accepted
    pub accepted: bool,
    /// The limit the client is measured against
    pub limit: u32,
    /// Tokens the client could still use right now
    pub remaining: u32,
    /// Earliest instant a request of the same size could pass
    pub retry_after: DateTime<Utc>,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}

impl RateLimit {
    fn from_decision(key: &LimiterKey, decision: Decision, now: DateTime<Utc>) -> Self {
        Self {
            route: key.route.clone(),
            client: key.client.clone(),
            accepted: decision.accepted,
            limit: decision.limit,
            remaining: decision.remaining,
            retry_after: decision.retry_after,
            decided_at: now,
        }
    }

    /// The verdict for a disabled route.
    fn unlimited(key: &LimiterKey, now: DateTime<Utc>) -> Self {
        Self {
            route: key.route.clone(),
            client: key.client.clone(),
            accepted: true,
            limit: u32::MAX,
            remaining: u32::MAX,
            retry_after: now,
            decided_at: now,
        }
    }

    /// How long to wait before retrying, relative to the decision.
    pub fn wait(&self) -> Duration {
        until(self.decided_at, self.retry_after)
    }

    /// Turn a rejection into a `LimitExceeded` error.
    pub fn ensure_accepted(self) -> Result<Self> {
        if self.accepted {
            Ok(self)
        } else {
            Err(WardenError::LimitExceeded {
                route: self.route,
                client: self.client,
                retry_after: self.retry_after,
            })
        }
    }
}

/// The rate limiter that evaluates routes for client keys.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
/// Updates of the same (route, client) pair are serialised by the store.
pub struct RateLimiter {
    /// Route rules, swappable at runtime
    config: RwLock<RateLimitConfig>,
    /// Per-caller state
    store: Arc<dyn LimiterStore>,
    /// Time source
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter with an in-memory store and the system clock.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit store and clock.
    pub fn with_store(
        config: RateLimitConfig,
        store: Arc<dyn LimiterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            store,
            clock,
        }
    }

    /// Replace the rules.
    ///
    /// State of routes whose policy changed is replaced on its next use.
    pub fn set_config(&self, config: RateLimitConfig) {
        info!(routes = config.routes.len(), "Rate limit rules updated");
        *self.config.write() = config;
    }

    /// Get the current rules.
    pub fn config(&self) -> RateLimitConfig {
        self.config.read().clone()
    }

    /// Get the store backing this limiter.
    pub fn store(&self) -> &Arc<dyn LimiterStore> {
        &self.store
    }

    /// Consume one token, failing with `LimitExceeded` when over the limit.
    ///
    /// Call sites propagate the error with `?`.
    pub fn ensure_accepted(&self, route: &str, client: &str) -> Result<RateLimit> {
        self.consume(route, client, 1)?.ensure_accepted()
    }

    /// Consume `tokens` tokens and report the decision.
    ///
    /// Rejections are reported through `RateLimit::accepted`, not as errors.
    /// Zero tokens behaves like `peek`.
    pub fn consume(&self, route: &str, client: &str, tokens: u32) -> Result<RateLimit> {
        if tokens == 0 {
            return self.peek(route, client);
        }

        let route_config = self.route_config(route)?;
        let key = LimiterKey::new(route, client);
        let now = self.clock.now();

        if !route_config.enabled {
            trace!(key = %key, "Route disabled, accepting");
            return Ok(RateLimit::unlimited(&key, now));
        }

        if let Some(capacity) = route_config.policy.capacity() {
            if tokens > capacity {
                return Err(WardenError::InvalidTokens {
                    route: route.to_string(),
                    requested: tokens,
                    limit: capacity,
                });
            }
        }

        trace!(
            key = %key,
            tokens = tokens,
            policy = route_config.policy.kind(),
            "Checking rate limit"
        );

        let mut decision = None;
        self.store.update(&key, now, &mut |slot| {
            let mut state = match slot.take() {
                Some(stored) if !stored.is_expired(now) => stored.state,
                _ => {
                    debug!(
                        key = %key,
                        policy = route_config.policy.kind(),
                        "Creating new limiter state"
                    );
                    LimiterState::fresh(&route_config.policy, now)
                }
            };

            decision = Some(state.consume(&route_config.policy, route_config.reset, tokens, now));
            let expires_at = state.expires_at(&route_config.policy, route_config.reset);
            *slot = Some(StoredState { state, expires_at });
        });

        let decision = decision.ok_or_else(|| {
            WardenError::Store(format!("store did not apply the update for {}", key))
        })?;

        if !decision.accepted {
            debug!(
                key = %key,
                retry_after = %decision.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(RateLimit::from_decision(&key, decision, now))
    }

    /// Report whether a single-token request would pass, without consuming.
    pub fn peek(&self, route: &str, client: &str) -> Result<RateLimit> {
        let route_config = self.route_config(route)?;
        let key = LimiterKey::new(route, client);
        let now = self.clock.now();

        if !route_config.enabled {
            return Ok(RateLimit::unlimited(&key, now));
        }

        let mut state = match self.store.get(&key) {
            Some(stored) if !stored.is_expired(now) => stored.state,
            _ => LimiterState::fresh(&route_config.policy, now),
        };
        let decision = state.consume(&route_config.policy, route_config.reset, 0, now);

        Ok(RateLimit::from_decision(&key, decision, now))
    }

    /// Clear the state of one client on one route.
    ///
    /// Returns whether any state existed. Other clients of the route keep theirs.
    #[instrument(skip(self))]
    pub fn reset(&self, route: &str, client: &str) -> Result<bool> {
        self.route_config(route)?;
        let key = LimiterKey::new(route, client);
        let existed = self.store.remove(&key);
        debug!(key = %key, existed = existed, "Rate limit state reset");
        Ok(existed)
    }

    /// Clear the state of every client of a route.
    #[instrument(skip(self))]
    pub fn reset_route(&self, route: &str) -> Result<usize> {
        self.route_config(route)?;
        let removed = self.store.remove_route(route);
        info!(route = %route, removed = removed, "Rate limit route reset");
        Ok(removed)
    }

    /// Drop every expired state.
    pub fn purge_expired(&self) -> usize {
        let removed = self.store.purge_expired(self.clock.now());
        if removed > 0 {
            info!(
                removed = removed,
                remaining = self.store.len(),
                "Purged expired limiter state"
            );
        }
        removed
    }

    /// Spawn a task that purges expired state every `period`.
    ///
    /// The task runs until it is aborted.
    pub fn spawn_purge_task(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.purge_expired();
            }
        })
    }

    /// Get the number of stored states.
    pub fn state_count(&self) -> usize {
        self.store.len()
    }

    fn route_config(&self, route: &str) -> Result<RouteConfig> {
        self.config
            .read()
            .route(route)
            .cloned()
            .ok_or_else(|| WardenError::UnknownRoute(route.to_string()))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
