use std::time::Duration;
use tokio::time::Instant;

/// Token bucket: `burst` tokens, refilled at `rate_per_sec`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    /// Takes a token if one is available.
    pub fn allow(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.rate_per_sec.is_infinite() {
            self.tokens = self.burst;
        } else {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        }
    }
}

/// Coalesces repeated changes into at most one upstream call per interval.
///
/// `set` records that something changed; `debounce` says whether the caller
/// should push the change now; `flush` says whether anything is left to push
/// regardless of the rate limit.
#[derive(Debug, Clone)]
pub struct Debouncer {
    limiter: TokenBucket,
    pending: bool,
}

impl Debouncer {
    /// One call per `interval`, with up to `burst` calls back to back.
    pub fn new(interval: Duration, burst: u32) -> Self {
        let rate = if interval.is_zero() {
            f64::INFINITY
        } else {
            1.0 / interval.as_secs_f64()
        };
        Self {
            limiter: TokenBucket::new(rate, burst),
            pending: false,
        }
    }

    pub fn set(&mut self) {
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// True (and clears the pending mark) if a change is pending and the rate
    /// limit allows a call now.
    pub fn debounce(&mut self) -> bool {
        if !self.pending || !self.limiter.allow() {
            return false;
        }
        self.pending = false;
        true
    }

    /// True (and clears the pending mark) if a change is pending.
    pub fn flush(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }
}
