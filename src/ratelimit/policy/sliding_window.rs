//! Sliding window counter approximated with two adjacent windows.
//!
//! The count of the previous window is weighted by how much of it still
//! overlaps a window of `interval` ending now.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Decision;
use crate::ratelimit::clock::{after, until};
use crate::ratelimit::rules::WindowParams;

/// Counts for the current and previous windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    /// When the current window started
    pub window_start: DateTime<Utc>,
    /// Hits accepted in the current window
    pub current: u32,
    /// Hits accepted in the window before it
    pub previous: u32,
}

impl SlidingWindowState {
    /// A state whose first window opens at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            current: 0,
            previous: 0,
        }
    }

    /// Try to take `tokens` hits.
    pub fn consume(&mut self, params: &WindowParams, tokens: u32, now: DateTime<Utc>) -> Decision {
        self.roll(params, now);

        let used = self.effective_count(params, now);
        let available = params.limit.saturating_sub(used);
        let needed = tokens.max(1);

        if tokens == 0 || tokens > available {
            let accepted = tokens == 0 && available > 0;
            let retry_after = if needed <= available {
                now
            } else {
                self.available_at(params, needed, now)
            };
            return Decision {
                accepted,
                limit: params.limit,
                remaining: available,
                retry_after,
            };
        }

        self.current += tokens;
        let remaining = available - tokens;
        let retry_after = if remaining > 0 {
            now
        } else {
            self.available_at(params, 1, now)
        };

        Decision {
            accepted: true,
            limit: params.limit,
            remaining,
            retry_after,
        }
    }

    /// The instant both windows have fully slid out.
    pub fn expires_at(&self, params: &WindowParams) -> DateTime<Utc> {
        let span = params.interval.checked_mul(2).unwrap_or(Duration::MAX);
        after(self.window_start, span)
    }

    /// Move the window forward so that it contains `now`.
    fn roll(&mut self, params: &WindowParams, now: DateTime<Utc>) {
        let interval_ms = params.interval.as_millis().max(1);
        let elapsed_ms = until(self.window_start, now).as_millis();
        let windows = elapsed_ms / interval_ms;

        if windows == 0 {
            return;
        }

        self.previous = if windows == 1 { self.current } else { 0 };
        self.current = 0;
        let skipped = u64::try_from(windows * interval_ms).unwrap_or(u64::MAX);
        self.window_start = after(self.window_start, Duration::from_millis(skipped));
    }

    /// Fraction of the current window that has elapsed.
    fn elapsed_fraction(&self, params: &WindowParams, now: DateTime<Utc>) -> f64 {
        let elapsed = until(self.window_start, now).as_secs_f64();
        (elapsed / params.interval.as_secs_f64()).clamp(0.0, 1.0)
    }

    fn effective_count(&self, params: &WindowParams, now: DateTime<Utc>) -> u32 {
        let weight = 1.0 - self.elapsed_fraction(params, now);
        let weighted_previous = (self.previous as f64 * weight).floor() as u32;
        weighted_previous.saturating_add(self.current)
    }

    /// Earliest instant at which `needed` hits fit, assuming no other traffic.
    fn available_at(
        &self,
        params: &WindowParams,
        needed: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let (base, weighted, budget) = if self.current.saturating_add(needed) > params.limit {
            // Only once the current window has become the previous one
            (
                after(self.window_start, params.interval),
                self.current,
                params.limit.checked_sub(needed),
            )
        } else {
            (
                self.window_start,
                self.previous,
                Some(params.limit - needed - self.current),
            )
        };

        let Some(budget) = budget else {
            return after(base, params.interval).max(now);
        };

        // floor(weighted * (window - m) / window) <= budget holds once
        // weighted * (window - m) < (budget + 1) * window
        let bound = u128::from(budget) + 1;
        let weighted = u128::from(weighted);
        if weighted < bound {
            return base.max(now);
        }

        let window_ms = params.interval.as_millis().max(1);
        let offset_ms = window_ms * (weighted - bound) / weighted + 1;
        let offset = Duration::from_millis(u64::try_from(offset_ms).unwrap_or(u64::MAX));
        after(base, offset).max(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params(limit: u32, secs: u64) -> WindowParams {
        WindowParams {
            limit,
            interval: Duration::from_secs(secs),
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_accepts_up_to_limit_in_first_window() {
        let params = params(10, 60);
        let mut state = SlidingWindowState::new(t(0));

        for _ in 0..10 {
            assert!(state.consume(&params, 1, t(1)).accepted);
        }
        let decision = state.consume(&params, 1, t(2));
        assert!(!decision.accepted);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_previous_window_is_weighted() {
        let params = params(10, 60);
        let mut state = SlidingWindowState::new(t(0));
        assert!(state.consume(&params, 10, t(0)).accepted);

        // New window starts, previous still weighs fully
        let decision = state.consume(&params, 1, t(60));
        assert!(!decision.accepted);
        assert_eq!(state.previous, 10);
        assert_eq!(state.current, 0);

        // Halfway through, half of the previous window has slid out
        let decision = state.consume(&params, 0, t(90));
        assert_eq!(decision.remaining, 5);
        assert!(state.consume(&params, 5, t(90)).accepted);
        assert!(!state.consume(&params, 1, t(90)).accepted);
    }

    #[test]
    fn test_retry_after_points_at_decay() {
        let params = params(10, 60);
        let mut state = SlidingWindowState::new(t(0));
        state.consume(&params, 10, t(0));

        // At t=60 the previous window weighs 10; any decay rounds it down to 9
        let decision = state.consume(&params, 1, t(60));
        assert!(!decision.accepted);
        assert_eq!(decision.retry_after, t(60) + chrono::Duration::milliseconds(1));
        assert!(state.consume(&params, 1, decision.retry_after).accepted);
        assert!(!state.consume(&params, 1, decision.retry_after).accepted);
    }

    #[test]
    fn test_retry_after_is_earliest_instant() {
        let params = params(10, 60);
        let mut state = SlidingWindowState::new(t(0));
        state.consume(&params, 10, t(0));

        // Five hits need the previous window to weigh less than 6
        let decision = state.consume(&params, 5, t(60));
        assert!(!decision.accepted);
        assert_eq!(decision.retry_after, t(84) + chrono::Duration::milliseconds(1));

        assert!(!state.consume(&params, 5, t(83)).accepted);
        assert!(state.consume(&params, 5, decision.retry_after).accepted);
    }

    #[test]
    fn test_retry_after_when_current_window_is_full() {
        let params = params(4, 10);
        let mut state = SlidingWindowState::new(t(0));
        state.consume(&params, 4, t(2));

        let decision = state.consume(&params, 1, t(3));
        assert!(!decision.accepted);
        // The 4 hits move to the previous window at t=10 and round down to 3 at once
        assert_eq!(decision.retry_after, t(10) + chrono::Duration::milliseconds(1));
        assert!(!state.consume(&params, 1, t(10)).accepted);
        assert!(state.consume(&params, 1, decision.retry_after).accepted);
    }

    #[test]
    fn test_huge_interval_does_not_overflow() {
        let params = WindowParams {
            limit: 1,
            interval: Duration::from_secs(u64::MAX),
        };
        let mut state = SlidingWindowState::new(t(0));

        assert!(state.consume(&params, 1, t(0)).accepted);
        assert_eq!(state.expires_at(&params), DateTime::<Utc>::MAX_UTC);

        let decision = state.consume(&params, 1, t(1));
        assert!(!decision.accepted);
        assert_eq!(decision.retry_after, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_long_gap_clears_previous() {
        let params = params(3, 10);
        let mut state = SlidingWindowState::new(t(0));
        state.consume(&params, 3, t(0));

        let decision = state.consume(&params, 3, t(25));
        assert!(decision.accepted);
        assert_eq!(state.previous, 0);
        assert_eq!(state.window_start, t(20));
        assert_eq!(state.expires_at(&params), t(40));
    }
}
