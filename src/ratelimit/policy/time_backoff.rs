//! Time backoff: throttling that escalates with the number of attempts.
//!
//! Each step says "once a caller has made `limit` attempts, the next attempt
//! must come at least `interval` after the previous accepted one". The attempt
//! count is forgotten after `reset` without accepted attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Decision;
use crate::ratelimit::clock::after;
use crate::ratelimit::rules::BackoffParams;

/// Attempts made by one caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBackoffState {
    /// Accepted attempts since the last reset
    pub attempts: u64,
    /// When the last attempt was accepted
    pub last_attempt: Option<DateTime<Utc>>,
}

impl TimeBackoffState {
    /// A caller with no attempts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to record `tokens` attempts.
    pub fn consume(
        &mut self,
        params: &BackoffParams,
        reset: Duration,
        tokens: u32,
        now: DateTime<Utc>,
    ) -> Decision {
        self.maybe_reset(reset, now);

        let limit = Self::threshold(params, self.attempts);
        let throttled_until = self.throttled_until(params, now);

        if tokens == 0 {
            return Decision {
                accepted: throttled_until.is_none(),
                limit,
                remaining: match throttled_until {
                    Some(_) => 0,
                    None => Self::remaining(params, self.attempts),
                },
                retry_after: throttled_until.unwrap_or(now),
            };
        }

        if let Some(until) = throttled_until {
            return Decision::rejected(limit, 0, until);
        }

        self.attempts = self.attempts.saturating_add(u64::from(tokens));
        self.last_attempt = Some(now);

        let retry_after = params
            .active_step(self.attempts)
            .map(|step| after(now, step.interval))
            .unwrap_or(now);

        Decision {
            accepted: true,
            limit: Self::threshold(params, self.attempts),
            remaining: Self::remaining(params, self.attempts),
            retry_after,
        }
    }

    /// The instant the attempt count is forgotten.
    pub fn expires_at(&self, reset: Duration) -> DateTime<Utc> {
        self.last_attempt
            .map(|last| after(last, reset))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn maybe_reset(&mut self, reset: Duration, now: DateTime<Utc>) {
        if let Some(last) = self.last_attempt {
            if now >= after(last, reset) {
                self.attempts = 0;
                self.last_attempt = None;
            }
        }
    }

    fn throttled_until(
        &self,
        params: &BackoffParams,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let last = self.last_attempt?;
        let step = params.active_step(self.attempts)?;
        let until = after(last, step.interval);
        (now < until).then_some(until)
    }

    /// Threshold of the next step to engage, or of the last step once all are active.
    fn threshold(params: &BackoffParams, attempts: u64) -> u32 {
        params
            .next_step(attempts)
            .or_else(|| params.limits.last())
            .map(|step| step.limit)
            .unwrap_or(0)
    }

    fn remaining(params: &BackoffParams, attempts: u64) -> u32 {
        params
            .next_step(attempts)
            .map(|step| u64::from(step.limit).saturating_sub(attempts))
            .map(|left| u32::try_from(left).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }
}
