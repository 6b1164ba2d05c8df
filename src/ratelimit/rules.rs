//! Rate limit rules configuration.
//!
//! This module handles loading and validating the per-route rate limit rules.
//! A rule file maps route keys to a policy and its parameters:
//!
//! ```yaml
//! rate_limiter:
//!   login:
//!     enabled: true
//!     policy: time_backoff
//!     reset: 24 hours
//!     limits:
//!       - limit: 3
//!         interval: 10 seconds
//!       - limit: 5
//!         interval: 60 seconds
//!   contact_form:
//!     policy: fixed_window
//!     limit: 5
//!     interval: 1 minute
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::interval::{serde_interval, serde_interval_opt};
use crate::error::{Result, WardenError};

/// Optional top-level key wrapping the route map.
const WRAPPER_KEY: &str = "rate_limiter";

/// A complete rate limit configuration containing every route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Map of route key to route configuration
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
}

/// Configuration for a single route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Disabled routes accept every request and keep no state
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Idle period after which a caller's state is forgotten
    #[serde(default, with = "serde_interval_opt", skip_serializing_if = "Option::is_none")]
    pub reset: Option<Duration>,
    /// The policy and its parameters
    #[serde(flatten)]
    pub policy: PolicyConfig,
}

fn default_enabled() -> bool {
    true
}

/// The limiting policy of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// At most `limit` requests per window opened by the first request
    FixedWindow(WindowParams),
    /// At most `limit` requests in any `interval`, weighted over two windows
    SlidingWindow(WindowParams),
    /// A bucket of `limit` tokens refilled at a constant rate
    TokenBucket(TokenBucketParams),
    /// Throttling that grows with the number of attempts
    TimeBackoff(BackoffParams),
}

/// Parameters shared by the window policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowParams {
    /// Requests allowed per window
    pub limit: u32,
    /// Window length
    #[serde(with = "serde_interval")]
    pub interval: Duration,
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketParams {
    /// Bucket size
    pub limit: u32,
    /// Refill rate
    pub rate: RefillRate,
}

/// How fast a token bucket refills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefillRate {
    /// Period over which `amount` tokens are added
    #[serde(with = "serde_interval")]
    pub interval: Duration,
    /// Tokens added per period
    #[serde(default = "default_refill_amount")]
    pub amount: u32,
}

fn default_refill_amount() -> u32 {
    1
}

impl RefillRate {
    /// Tokens added per second.
    pub fn tokens_per_second(&self) -> f64 {
        self.amount as f64 / self.interval.as_secs_f64()
    }
}

/// Time backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffParams {
    /// Steps ordered by ascending attempt threshold
    pub limits: Vec<BackoffStep>,
}

/// One step of a time backoff.
///
/// Once a caller has made `limit` attempts, every further attempt must wait
/// `interval` after the previous accepted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffStep {
    /// Attempt threshold at which this step engages
    pub limit: u32,
    /// Throttle duration between attempts
    #[serde(with = "serde_interval")]
    pub interval: Duration,
}

impl BackoffParams {
    /// The step active after `attempts` accepted attempts, if any.
    pub fn active_step(&self, attempts: u64) -> Option<&BackoffStep> {
        self.limits
            .iter()
            .rev()
            .find(|step| u64::from(step.limit) <= attempts)
    }

    /// The first step not yet engaged after `attempts` attempts.
    pub fn next_step(&self, attempts: u64) -> Option<&BackoffStep> {
        self.limits.iter().find(|step| u64::from(step.limit) > attempts)
    }
}

impl PolicyConfig {
    /// The policy name as written in rule files.
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyConfig::FixedWindow(_) => "fixed_window",
            PolicyConfig::SlidingWindow(_) => "sliding_window",
            PolicyConfig::TokenBucket(_) => "token_bucket",
            PolicyConfig::TimeBackoff(_) => "time_backoff",
        }
    }

    /// The most tokens a single request may ask for, if bounded.
    pub fn capacity(&self) -> Option<u32> {
        match self {
            PolicyConfig::FixedWindow(p) | PolicyConfig::SlidingWindow(p) => Some(p.limit),
            PolicyConfig::TokenBucket(p) => Some(p.limit),
            PolicyConfig::TimeBackoff(_) => None,
        }
    }
}

impl RouteConfig {
    /// Check the route for values that can never work.
    pub fn validate(&self, route: &str) -> Result<()> {
        let invalid = |reason: &str| {
            Err(WardenError::Config(format!("route '{}': {}", route, reason)))
        };

        if route.is_empty() {
            return Err(WardenError::Config("route key must not be empty".to_string()));
        }

        if self.reset.is_some() && !matches!(self.policy, PolicyConfig::TimeBackoff(_)) {
            warn!(
                route = %route,
                policy = self.policy.kind(),
                "reset is only used by time_backoff, ignoring it"
            );
        }

        match &self.policy {
            PolicyConfig::FixedWindow(p) | PolicyConfig::SlidingWindow(p) => {
                if p.limit == 0 {
                    return invalid("limit must be greater than zero");
                }
            }
            PolicyConfig::TokenBucket(p) => {
                if p.limit == 0 {
                    return invalid("limit must be greater than zero");
                }
                if p.rate.amount == 0 {
                    return invalid("rate.amount must be greater than zero");
                }
            }
            PolicyConfig::TimeBackoff(p) => {
                if self.reset.is_none() {
                    return invalid("time_backoff requires a reset interval");
                }
                if p.limits.is_empty() {
                    return invalid("time_backoff requires at least one entry in limits");
                }
                if p.limits.windows(2).any(|pair| pair[0].limit >= pair[1].limit) {
                    return invalid("time_backoff limits must be strictly increasing");
                }
            }
        }

        Ok(())
    }
}

impl RateLimitConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    ///
    /// The route map may sit at the top level or under a single
    /// `rate_limiter` key.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::new());
        }

        let mut document: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rate limit rules: {}", e)))?;

        if document.is_null() {
            return Ok(Self::new());
        }

        if let serde_yaml::Value::Mapping(ref mut mapping) = document {
            if mapping.len() == 1 {
                if let Some(inner) = mapping.remove(WRAPPER_KEY) {
                    document = inner;
                }
            }
        }

        let routes: BTreeMap<String, RouteConfig> = if document.is_null() {
            BTreeMap::new()
        } else {
            serde_yaml::from_value(document).map_err(|e| {
                WardenError::Config(format!("Failed to parse rate limit rules: {}", e))
            })?
        };

        let config = Self { routes };
        config.validate()?;
        Ok(config)
    }

    /// Validate every route.
    pub fn validate(&self) -> Result<()> {
        for (name, route) in &self.routes {
            route.validate(name)?;
        }
        Ok(())
    }

    /// Get the configuration for a specific route.
    pub fn route(&self, name: &str) -> Option<&RouteConfig> {
        self.routes.get(name)
    }

    /// Add or replace a route.
    pub fn insert(&mut self, name: impl Into<String>, route: RouteConfig) {
        self.routes.insert(name.into(), route);
    }

    /// Iterate over all routes in key order.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &RouteConfig)> {
        self.routes.iter().map(|(name, route)| (name.as_str(), route))
    }
}
