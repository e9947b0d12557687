//! Bandwidth rate limiting.
//!
//! One token bucket per direction: tokens refill with wall-clock time at
//! the configured rate and accumulate to at most two seconds of burst.
//! Consuming more tokens than are available blocks until the refill
//! catches up, which is the sole pacing mechanism the synchronous
//! connection needs.

use std::thread;
use std::time::{Duration, Instant};

/// Burst allowance, in seconds of traffic at the configured rate.
const BURST_SECS: u64 = 2;

pub struct TokenBucket {
    /// Bytes per second.
    rate: u64,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket allowing `rate` bytes per second, starting full.
    pub fn new(rate: u64) -> TokenBucket {
        TokenBucket {
            rate: rate.max(1),
            tokens: rate.max(1) * BURST_SECS,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed();
        let earned = (elapsed.as_micros() as u64).saturating_mul(self.rate) / 1_000_000;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.rate * BURST_SECS);
            self.last_refill = Instant::now();
        }
    }

    /// Take `n` tokens, sleeping until the bucket can cover them.
    pub fn consume(&mut self, n: u64) {
        loop {
            self.refill();
            if self.tokens >= n {
                self.tokens -= n;
                return;
            }
            let needed = n - self.tokens;
            let wait = Duration::from_micros((needed.saturating_mul(1_000_000) / self.rate).max(1));
            thread::sleep(wait.min(Duration::from_millis(100)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_free_then_rate_applies() {
        let mut bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();
        // Two seconds of burst go through immediately.
        bucket.consume(2_000_000);
        assert!(start.elapsed() < Duration::from_millis(500));
        // The next chunk has to wait for refill.
        bucket.consume(100_000);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn tokens_cap_at_burst() {
        let mut bucket = TokenBucket::new(1000);
        thread::sleep(Duration::from_millis(50));
        bucket.refill();
        assert!(bucket.tokens <= 2000);
    }
}
