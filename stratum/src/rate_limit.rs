use std::time::{Duration, Instant};

/// A session is cut once it exceeds its configured rate by this factor.
pub const RATE_LIMIT_THRESHOLD_MULTIPLIER: u32 = 10;

/// Fixed window message counter.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, window_start: Instant::now(), count: 0 }
    }

    /// Allows `max_messages_per_second` times the threshold multiplier per second.
    pub fn disconnect_threshold(max_messages_per_second: u32) -> Self {
        Self::new(max_messages_per_second.saturating_mul(RATE_LIMIT_THRESHOLD_MULTIPLIER), Duration::from_secs(1))
    }

    /// Counts one message; false once the current window holds more than the limit.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_limit_and_reset() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        limiter.window_start = start;

        assert!((0..3).all(|_| limiter.check_at(start)));
        assert!(!limiter.check_at(start + Duration::from_millis(500)));
        assert!(limiter.check_at(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_disconnect_threshold_scales_limit() {
        let start = Instant::now();
        let mut limiter = RateLimiter::disconnect_threshold(2);
        limiter.window_start = start;
        assert!((0..20).all(|_| limiter.check_at(start)));
        assert!(!limiter.check_at(start));
    }
}
