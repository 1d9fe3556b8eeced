//! Sliding-window admission control for a single API endpoint.
//!
//! Twitter allows N requests per window per endpoint. The limiter counts
//! locally admitted requests, but it also accepts corrections from the
//! server (`x-rate-limit-reset`) because the real quota can be shared with
//! other processes using the same token.

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub struct RateLimiter {
    capacity: u32,
    window: chrono::Duration,
    state: Mutex<WindowState>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct WindowState {
    admitted: u32,
    window_start: Option<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self::with_clock(capacity, window, Arc::new(SystemClock))
    }

    /// A zero capacity is treated as one request per window.
    pub fn with_clock(capacity: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            state: Mutex::new(WindowState::default()),
            clock,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tries to reserve one request. Returns true if the request may run now.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.reset_if_elapsed(&mut state, now);

        if state.admitted < self.capacity {
            if state.admitted == 0 {
                state.window_start = Some(now);
            }
            state.admitted += 1;
            return true;
        }

        false
    }

    /// How long until the next request can run. Zero when under capacity.
    pub fn wait_time(&self) -> Duration {
        let now = self.clock.now();
        let state = self.state.lock();
        if state.admitted < self.capacity {
            return Duration::ZERO;
        }

        let start = state.window_start.unwrap_or(now);
        (self.window - (now - start))
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Puts the limiter into the exhausted state, e.g. after the server
    /// answered 429 before local accounting noticed.
    pub fn mark_limited(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.admitted = self.capacity;
        state.window_start.get_or_insert(now);
    }

    /// Exhausts the limiter and moves the window so that the next admission
    /// becomes legal exactly at `timestamp` (epoch seconds).
    pub fn set_available_time(&self, timestamp: i64) {
        let available = match Utc.timestamp_opt(timestamp, 0).single() {
            Some(t) => t,
            None => return,
        };
        let mut state = self.state.lock();
        state.admitted = self.capacity;
        state.window_start = available.checked_sub_signed(self.window);
    }

    fn reset_if_elapsed(&self, state: &mut WindowState, now: DateTime<Utc>) {
        if state.admitted == 0 {
            return;
        }
        if let Some(start) = state.window_start {
            if now - start >= self.window {
                state.admitted = 0;
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("window", &self.window)
            .field("admitted", &state.admitted)
            .field("window_start", &state.window_start)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn limiter(capacity: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        (RateLimiter::with_clock(capacity, WINDOW, clock.clone()), clock)
    }

    #[test]
    fn test_allows_up_to_capacity() {
        let (l, _) = limiter(10);
        for i in 0..10 {
            assert!(l.allow(), "request {} should be admitted", i);
        }
        assert!(!l.allow());
    }

    #[test]
    fn test_allows_again_after_window() {
        let (l, clock) = limiter(10);
        for _ in 0..10 {
            l.allow();
        }
        assert!(!l.allow());

        clock.advance(chrono::Duration::minutes(16));
        assert!(l.allow());
    }

    #[test]
    fn test_window_is_measured_from_first_admission() {
        let (l, clock) = limiter(2);
        assert!(l.allow());
        clock.advance(chrono::Duration::minutes(10));
        assert!(l.allow());
        assert!(!l.allow());

        // 15 minutes after the first request, not the second
        clock.advance(chrono::Duration::minutes(5));
        assert!(l.allow());
    }

    #[test]
    fn test_wait_time() {
        let (l, clock) = limiter(10);
        assert_eq!(l.wait_time(), Duration::ZERO);

        for _ in 0..10 {
            l.allow();
        }
        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(l.wait_time(), Duration::from_secs(14 * 60));
    }

    #[test]
    fn test_wait_time_never_negative() {
        let (l, clock) = limiter(1);
        l.allow();
        clock.advance(chrono::Duration::minutes(20));
        assert_eq!(l.wait_time(), Duration::ZERO);
    }

    #[test]
    fn test_mark_limited_keeps_window_start() {
        let (l, clock) = limiter(5);
        assert!(l.allow());
        clock.advance(chrono::Duration::minutes(5));
        l.mark_limited();
        assert!(!l.allow());
        assert_eq!(l.wait_time(), Duration::from_secs(10 * 60));
    }

    #[test]
    fn test_set_available_time() {
        let (l, clock) = limiter(3);
        let available = clock.now() + chrono::Duration::minutes(7);

        l.allow();
        l.mark_limited();
        l.set_available_time(available.timestamp());

        clock.set(available - chrono::Duration::seconds(1));
        assert!(!l.allow());
        assert_eq!(l.wait_time(), Duration::from_secs(1));

        clock.set(available);
        assert!(l.allow());
    }

    #[test]
    fn test_set_available_time_blocks_unused_limiter() {
        let (l, clock) = limiter(5);
        let available = clock.now() + chrono::Duration::minutes(2);
        l.set_available_time(available.timestamp());

        assert!(!l.allow());
        assert_eq!(l.wait_time(), Duration::from_secs(2 * 60));

        clock.set(available);
        assert!(l.allow());
    }

    #[test]
    fn test_set_available_time_after_window_admits() {
        let (l, clock) = limiter(1);
        l.mark_limited();
        let available = clock.now() + chrono::Duration::seconds(30);
        l.set_available_time(available.timestamp());

        clock.set(available + chrono::Duration::seconds(10));
        assert!(l.allow());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (l, _) = limiter(0);
        assert_eq!(l.capacity(), 1);
        assert!(l.allow());
        assert!(!l.allow());
    }

    #[test]
    fn test_concurrent_callers_never_exceed_capacity() {
        let (l, _) = limiter(50);
        let l = Arc::new(l);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let l = l.clone();
                std::thread::spawn(move || (0..20).filter(|_| l.allow()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
