//! Fixed window counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Decision;
use crate::ratelimit::clock::after;
use crate::ratelimit::rules::WindowParams;

/// Hits counted in a window opened by the first request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowState {
    /// When the current window started
    pub window_start: DateTime<Utc>,
    /// Hits accepted in the current window
    pub hits: u32,
}

impl FixedWindowState {
    /// A state with an empty window opening at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            hits: 0,
        }
    }

    /// Try to take `tokens` hits from the window.
    pub fn consume(&mut self, params: &WindowParams, tokens: u32, now: DateTime<Utc>) -> Decision {
        self.maybe_reset_window(params, now);

        let window_end = after(self.window_start, params.interval);
        let available = params.limit.saturating_sub(self.hits);

        if tokens == 0 {
            return Decision {
                accepted: available > 0,
                limit: params.limit,
                remaining: available,
                retry_after: if available > 0 { now } else { window_end },
            };
        }

        if tokens > available {
            return Decision::rejected(params.limit, available, window_end);
        }

        self.hits += tokens;
        let remaining = available - tokens;

        Decision {
            accepted: true,
            limit: params.limit,
            remaining,
            retry_after: if remaining > 0 { now } else { window_end },
        }
    }

    /// The instant this state no longer matters.
    pub fn expires_at(&self, params: &WindowParams) -> DateTime<Utc> {
        after(self.window_start, params.interval)
    }

    /// Start a new window if the current one has elapsed.
    fn maybe_reset_window(&mut self, params: &WindowParams, now: DateTime<Utc>) {
        if now >= after(self.window_start, params.interval) {
            self.window_start = now;
            self.hits = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

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
    fn test_accepts_up_to_limit() {
        let params = params(5, 60);
        let mut state = FixedWindowState::new(t(0));

        for expected_remaining in (0..5).rev() {
            let decision = state.consume(&params, 1, t(1));
            assert!(decision.accepted);
            assert_eq!(decision.remaining, expected_remaining);
        }

        // The 6th request should be rejected until the window closes
        let decision = state.consume(&params, 1, t(2));
        assert!(!decision.accepted);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, t(60));
    }

    #[test]
    fn test_window_restarts_after_interval() {
        let params = params(2, 10);
        let mut state = FixedWindowState::new(t(0));

        assert!(state.consume(&params, 2, t(0)).accepted);
        assert!(!state.consume(&params, 1, t(9)).accepted);

        let decision = state.consume(&params, 1, t(10));
        assert!(decision.accepted);
        assert_eq!(state.window_start, t(10));
        assert_eq!(state.hits, 1);
        assert_eq!(state.expires_at(&params), t(20));
    }

    #[test]
    fn test_multi_token_request() {
        let params = params(10, 60);
        let mut state = FixedWindowState::new(t(0));

        assert!(state.consume(&params, 8, t(0)).accepted);
        assert!(!state.consume(&params, 3, t(0)).accepted); // 8 + 3 = 11, exceeds limit
        assert!(state.consume(&params, 2, t(0)).accepted); // 8 + 2 = 10, within limit
        assert_eq!(state.hits, 10);
    }

    #[test]
    fn test_peek_does_not_count() {
        let params = params(1, 60);
        let mut state = FixedWindowState::new(t(0));

        let peek = state.consume(&params, 0, t(0));
        assert!(peek.accepted);
        assert_eq!(peek.remaining, 1);
        assert_eq!(state.hits, 0);

        state.consume(&params, 1, t(0));
        let peek = state.consume(&params, 0, t(5));
        assert!(!peek.accepted);
        assert_eq!(peek.retry_after, t(60));
    }
}
