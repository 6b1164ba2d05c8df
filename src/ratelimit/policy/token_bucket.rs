//! Token bucket with continuous refill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Decision;
use crate::ratelimit::clock::{after, until};
use crate::ratelimit::rules::TokenBucketParams;

/// Absorbs float error in refill arithmetic.
const EPSILON: f64 = 1e-9;

/// Tokens left in the bucket at `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Tokens available at the last update
    pub tokens: f64,
    /// Last time the bucket was refilled
    pub updated_at: DateTime<Utc>,
}

impl TokenBucketState {
    /// A full bucket.
    pub fn new(params: &TokenBucketParams, now: DateTime<Utc>) -> Self {
        Self {
            tokens: params.limit as f64,
            updated_at: now,
        }
    }

    /// Try to take `tokens` tokens from the bucket.
    pub fn consume(
        &mut self,
        params: &TokenBucketParams,
        tokens: u32,
        now: DateTime<Utc>,
    ) -> Decision {
        self.refill(params, now);

        let available = self.whole_tokens();
        let needed = tokens.max(1);

        if tokens == 0 || self.tokens + EPSILON < tokens as f64 {
            return Decision {
                accepted: tokens == 0 && available > 0,
                limit: params.limit,
                remaining: available,
                retry_after: self.available_at(params, needed, now),
            };
        }

        self.tokens = (self.tokens - tokens as f64).max(0.0);

        Decision {
            accepted: true,
            limit: params.limit,
            remaining: self.whole_tokens(),
            retry_after: self.available_at(params, 1, now),
        }
    }

    /// The instant the bucket is full again.
    pub fn expires_at(&self, params: &TokenBucketParams) -> DateTime<Utc> {
        let missing = (params.limit as f64 - self.tokens).max(0.0);
        after(self.updated_at, seconds_to_duration(missing / params.rate.tokens_per_second()))
    }

    fn refill(&mut self, params: &TokenBucketParams, now: DateTime<Utc>) {
        if now <= self.updated_at {
            return;
        }

        let elapsed = until(self.updated_at, now).as_secs_f64();
        let refilled = self.tokens + elapsed * params.rate.tokens_per_second();
        self.tokens = refilled.min(params.limit as f64);
        self.updated_at = now;
    }

    fn whole_tokens(&self) -> u32 {
        (self.tokens + EPSILON).floor() as u32
    }

    /// When `needed` tokens will be in the bucket.
    fn available_at(
        &self,
        params: &TokenBucketParams,
        needed: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let missing = needed as f64 - self.tokens;
        if missing <= EPSILON {
            return now;
        }
        after(now, seconds_to_duration(missing / params.rate.tokens_per_second()))
    }
}

/// Round up to the next millisecond so a retry is never early.
fn seconds_to_duration(seconds: f64) -> Duration {
    let millis = (seconds * 1000.0 - EPSILON).ceil().max(0.0);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::RefillRate;
    use chrono::TimeZone;

    fn params(limit: u32, amount: u32, secs: u64) -> TokenBucketParams {
        TokenBucketParams {
            limit,
            rate: RefillRate {
                interval: Duration::from_secs(secs),
                amount,
            },
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_bucket_starts_full() {
        let params = params(3, 1, 1);
        let mut state = TokenBucketState::new(&params, t(0));

        for expected in [2, 1, 0] {
            let decision = state.consume(&params, 1, t(0));
            assert!(decision.accepted);
            assert_eq!(decision.remaining, expected);
        }

        let decision = state.consume(&params, 1, t(0));
        assert!(!decision.accepted);
        assert_eq!(decision.retry_after, t(1));
    }

    #[test]
    fn test_refill_over_time() {
        let params = params(20, 10, 60);
        let mut state = TokenBucketState::new(&params, t(0));
        assert!(state.consume(&params, 20, t(0)).accepted);

        // 10 tokens per minute, one every 6 seconds
        let decision = state.consume(&params, 1, t(3));
        assert!(!decision.accepted);
        assert_eq!(decision.retry_after, t(6));

        assert!(state.consume(&params, 1, t(6)).accepted);
        let peek = state.consume(&params, 0, t(60));
        assert_eq!(peek.remaining, 9);
    }

    #[test]
    fn test_refill_caps_at_limit() {
        let params = params(5, 1, 1);
        let mut state = TokenBucketState::new(&params, t(0));
        state.consume(&params, 5, t(0));

        let peek = state.consume(&params, 0, t(3600));
        assert_eq!(peek.remaining, 5);
        assert!((state.tokens - 5.0).abs() < EPSILON);
    }

    #[test]
    fn test_expires_when_full_again() {
        let params = params(4, 2, 1);
        let mut state = TokenBucketState::new(&params, t(0));
        state.consume(&params, 4, t(0));

        assert_eq!(state.expires_at(&params), t(2));
    }
}
