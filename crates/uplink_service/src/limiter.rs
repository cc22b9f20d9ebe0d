//! Sliding-window write budget.

use crate::error::{ServiceError, ServiceResult};
use std::collections::VecDeque;
use std::time::Duration;

/// Allows at most `limit` writes in any `window`.
#[derive(Debug)]
pub struct WriteLimiter {
    limit: u32,
    window_millis: i64,
    writes: VecDeque<i64>,
    rejected: u64,
}

impl WriteLimiter {
    /// Creates a limiter.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_millis: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            writes: VecDeque::new(),
            rejected: 0,
        }
    }

    /// Takes one write from the budget at `now_millis`.
    pub fn acquire(&mut self, now_millis: i64) -> ServiceResult<()> {
        self.expire(now_millis);
        if self.writes.len() >= self.limit as usize {
            self.rejected += 1;
            return Err(ServiceError::RateLimited {
                limit: self.limit,
                window_secs: u64::try_from(self.window_millis / 1000).unwrap_or(0),
            });
        }
        self.writes.push_back(now_millis);
        Ok(())
    }

    /// Writes left in the current window.
    pub fn remaining(&mut self, now_millis: i64) -> u32 {
        self.expire(now_millis);
        self.limit
            .saturating_sub(u32::try_from(self.writes.len()).unwrap_or(u32::MAX))
    }

    /// Writes refused so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn expire(&mut self, now_millis: i64) {
        while let Some(&oldest) = self.writes.front() {
            if now_millis - oldest >= self.window_millis {
                self.writes.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn budget_is_enforced() {
        let mut limiter = WriteLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            limiter.acquire(0).unwrap();
        }
        assert!(matches!(
            limiter.acquire(1_000),
            Err(ServiceError::RateLimited { limit: 3, .. })
        ));
        assert_eq!(limiter.rejected(), 1);
        assert_eq!(limiter.remaining(59_999), 0);
    }

    #[test]
    fn window_slides() {
        let mut limiter = WriteLimiter::new(2, Duration::from_secs(10));
        limiter.acquire(0).unwrap();
        limiter.acquire(5_000).unwrap();
        assert!(limiter.acquire(9_999).is_err());
        limiter.acquire(10_000).unwrap();
        assert_eq!(limiter.remaining(10_000), 0);
        assert_eq!(limiter.remaining(15_000), 1);
    }

    proptest! {
        #[test]
        fn never_exceeds_limit(gaps in proptest::collection::vec(0i64..5_000, 1..200)) {
            let window = 10_000;
            let mut limiter = WriteLimiter::new(5, Duration::from_millis(window as u64));
            let mut now = 0;
            let mut accepted: Vec<i64> = Vec::new();
            for gap in gaps {
                now += gap;
                if limiter.acquire(now).is_ok() {
                    accepted.push(now);
                }
                let in_window = accepted.iter().filter(|&&t| now - t < window).count();
                prop_assert!(in_window <= 5);
            }
        }
    }
}
