//! Per-caller limiter state for each policy.
//!
//! Every policy is a plain state struct with a transition
//! `consume(params, tokens, now) -> Decision`. They do no locking and read no
//! clock; the limiter serialises access per key and supplies the time.

mod fixed_window;
mod sliding_window;
mod time_backoff;
mod token_bucket;

pub use fixed_window::FixedWindowState;
pub use sliding_window::SlidingWindowState;
pub use time_backoff::TimeBackoffState;
pub use token_bucket::TokenBucketState;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rules::PolicyConfig;

/// Reset period assumed when a time backoff route has none configured.
const DEFAULT_BACKOFF_RESET: Duration = Duration::from_secs(24 * 3600);

/// Outcome of one consume call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the tokens were granted
    pub accepted: bool,
    /// The limit the caller is measured against
    pub limit: u32,
    /// Tokens that could still be granted right now
    pub remaining: u32,
    /// Earliest instant a request of the same size could pass
    pub retry_after: DateTime<Utc>,
}

impl Decision {
    pub(crate) fn rejected(limit: u32, remaining: u32, retry_after: DateTime<Utc>) -> Self {
        Self {
            accepted: false,
            limit,
            remaining,
            retry_after,
        }
    }
}

/// State of one (route, client) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LimiterState {
    FixedWindow(FixedWindowState),
    SlidingWindow(SlidingWindowState),
    TokenBucket(TokenBucketState),
    TimeBackoff(TimeBackoffState),
}

impl LimiterState {
    /// A state for a caller seen for the first time.
    pub fn fresh(policy: &PolicyConfig, now: DateTime<Utc>) -> Self {
        match policy {
            PolicyConfig::FixedWindow(_) => LimiterState::FixedWindow(FixedWindowState::new(now)),
            PolicyConfig::SlidingWindow(_) => {
                LimiterState::SlidingWindow(SlidingWindowState::new(now))
            }
            PolicyConfig::TokenBucket(p) => {
                LimiterState::TokenBucket(TokenBucketState::new(p, now))
            }
            PolicyConfig::TimeBackoff(_) => LimiterState::TimeBackoff(TimeBackoffState::new()),
        }
    }

    /// Whether this state was produced by the given policy kind.
    pub fn matches(&self, policy: &PolicyConfig) -> bool {
        matches!(
            (self, policy),
            (LimiterState::FixedWindow(_), PolicyConfig::FixedWindow(_))
                | (LimiterState::SlidingWindow(_), PolicyConfig::SlidingWindow(_))
                | (LimiterState::TokenBucket(_), PolicyConfig::TokenBucket(_))
                | (LimiterState::TimeBackoff(_), PolicyConfig::TimeBackoff(_))
        )
    }

    /// Apply a request of `tokens` tokens.
    ///
    /// A state left over from a different policy (after a rules reload) is
    /// replaced by a fresh one first.
    pub fn consume(
        &mut self,
        policy: &PolicyConfig,
        reset: Option<Duration>,
        tokens: u32,
        now: DateTime<Utc>,
    ) -> Decision {
        if !self.matches(policy) {
            *self = Self::fresh(policy, now);
        }

        match (self, policy) {
            (LimiterState::FixedWindow(state), PolicyConfig::FixedWindow(p)) => {
                state.consume(p, tokens, now)
            }
            (LimiterState::SlidingWindow(state), PolicyConfig::SlidingWindow(p)) => {
                state.consume(p, tokens, now)
            }
            (LimiterState::TokenBucket(state), PolicyConfig::TokenBucket(p)) => {
                state.consume(p, tokens, now)
            }
            (LimiterState::TimeBackoff(state), PolicyConfig::TimeBackoff(p)) => {
                state.consume(p, reset.unwrap_or(DEFAULT_BACKOFF_RESET), tokens, now)
            }
            _ => unreachable!("state was replaced to match the policy"),
        }
    }

    /// The instant after which this state is indistinguishable from a fresh one.
    pub fn expires_at(&self, policy: &PolicyConfig, reset: Option<Duration>) -> DateTime<Utc> {
        match (self, policy) {
            (LimiterState::FixedWindow(state), PolicyConfig::FixedWindow(p)) => state.expires_at(p),
            (LimiterState::SlidingWindow(state), PolicyConfig::SlidingWindow(p)) => {
                state.expires_at(p)
            }
            (LimiterState::TokenBucket(state), PolicyConfig::TokenBucket(p)) => state.expires_at(p),
            (LimiterState::TimeBackoff(state), PolicyConfig::TimeBackoff(_)) => {
                state.expires_at(reset.unwrap_or(DEFAULT_BACKOFF_RESET))
            }
            // Stale state from another policy is worthless
            _ => DateTime::<Utc>::MIN_UTC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{BackoffParams, BackoffStep, WindowParams};
    use chrono::TimeZone;

    fn fixed(limit: u32) -> PolicyConfig {
        PolicyConfig::FixedWindow(WindowParams {
            limit,
            interval: Duration::from_secs(60),
        })
    }

    fn backoff() -> PolicyConfig {
        PolicyConfig::TimeBackoff(BackoffParams {
            limits: vec![BackoffStep {
                limit: 1,
                interval: Duration::from_secs(30),
            }],
        })
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_fresh_state_matches_policy() {
        for policy in [fixed(1), backoff()] {
            let state = LimiterState::fresh(&policy, t(0));
            assert!(state.matches(&policy));
        }
        assert!(!LimiterState::fresh(&fixed(1), t(0)).matches(&backoff()));
    }

    #[test]
    fn test_policy_change_replaces_state() {
        let mut state = LimiterState::fresh(&fixed(1), t(0));
        assert!(state.consume(&fixed(1), None, 1, t(0)).accepted);
        assert!(!state.consume(&fixed(1), None, 1, t(1)).accepted);

        let decision = state.consume(&backoff(), Some(Duration::from_secs(60)), 1, t(2));
        assert!(decision.accepted);
        assert!(matches!(state, LimiterState::TimeBackoff(_)));
    }

    #[test]
    fn test_expiry_uses_route_reset() {
        let policy = backoff();
        let mut state = LimiterState::fresh(&policy, t(0));
        state.consume(&policy, Some(Duration::from_secs(600)), 1, t(0));

        assert_eq!(state.expires_at(&policy, Some(Duration::from_secs(600))), t(600));
        assert_eq!(state.expires_at(&fixed(1), None), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_state_serializes_with_policy_tag() {
        let state = LimiterState::fresh(&fixed(3), t(0));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["policy"], "fixed_window");
        assert_eq!(json["hits"], 0);

        let back: LimiterState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
