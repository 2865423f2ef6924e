//! HTTP-facing rate limiters
//!
//! Three independent token buckets gate the Public API Surface before a
//! request ever reaches the Admission Queue: a general bucket, a
//! tighter one for mutating email operations, and a stricter one for
//! auth-adjacent calls like alias generation (spec.md §6).

use std::time::{Duration, Instant};

/// A classic token bucket: refills continuously at `rate` tokens per
/// second, holds at most `burst` tokens, and a call either takes one
/// token or is rejected.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(burst: u32, rate_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(burst),
            tokens: f64::from(burst),
            refill_per_sec: rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    /// Take one token if available.
    ///
    /// Returns `Ok(())` if admitted, or `Err(retry_after)` — how long the
    /// caller should wait before trying again — if the bucket is empty.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// The three buckets guarding the Public API Surface.
pub struct ApiRateLimiters {
    pub general: TokenBucket,
    pub email_ops: TokenBucket,
    pub auth: TokenBucket,
}

impl ApiRateLimiters {
    /// Defaults per spec.md §6: a generous general ceiling, a tighter
    /// one for fetch/delete/attachment calls, and the tightest for
    /// alias generation and account listing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            general: TokenBucket::new(60, 1.0),
            email_ops: TokenBucket::new(20, 0.5),
            auth: TokenBucket::new(10, 0.2),
        }
    }
}

impl Default for ApiRateLimiters {
    fn default() -> Self {
        Self::new()
    }
}
