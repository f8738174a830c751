//! Campaign-scoped rate limiting
//!
//! A continuously refilling token bucket: tokens accrue at
//! `rate_limit_per_minute / 60` per second rather than resetting on minute
//! boundaries, so send pacing has no boundary bursts.

use std::time::Duration;
use tokio::time::Instant;

/// Token bucket with continuous refill
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket paced at `rate_per_minute` sends per minute. Capacity is a
    /// single token: sends are spaced evenly instead of bursting.
    pub fn per_minute(rate_per_minute: u32) -> Self {
        Self {
            rate_per_sec: f64::from(rate_per_minute.max(1)) / 60.0,
            capacity: 1.0,
            tokens: 1.0,
            last_refill: Instant::now(),
        }
    }

    /// Allow short bursts up to `capacity` accumulated tokens
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity.max(1.0);
        self.tokens = self.tokens.min(self.capacity);
        self
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token without waiting, if one is available
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and consume it
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let deficit = 1.0 - self.tokens;
            // Floor the wait so float rounding can never produce a zero
            // sleep and a busy loop
            let wait = Duration::from_secs_f64(deficit / self.rate_per_sec)
                .max(Duration::from_millis(1));
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_token_is_immediate_then_paced() {
        let mut bucket = TokenBucket::per_minute(60);
        let start = Instant::now();

        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        bucket.acquire().await;
        bucket.acquire().await;
        // 60/min = one per second; two more tokens take ~2s
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(1900) && elapsed <= Duration::from_millis(2200),
            "elapsed {:?}",
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_continuous_not_per_minute() {
        let mut bucket = TokenBucket::per_minute(2);
        bucket.acquire().await;

        // Half the inter-send gap: still no token
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!bucket.try_acquire());

        // The rest of the gap: token available without any minute boundary
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_bounds_accumulation() {
        let mut bucket = TokenBucket::per_minute(60);

        // A long idle period must not bank more than capacity
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }
}
