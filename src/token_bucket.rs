//! Token bucket rate limiting for provider operation classes.
//!
//! Each operation class (start job, poll job, synchronous detect) owns an
//! independent [`TokenBucket`]. Refill is lazy: every acquisition attempt first
//! credits `elapsed * rate` tokens (capped at capacity) and then tries to spend.
//!
//! # Invariants
//!
//! - `0 <= available <= capacity` whenever the state lock is released.
//! - Tokens only increase through refill and only decrease through a granted
//!   acquisition, so the total granted over any interval is bounded by
//!   `capacity + rate * elapsed`.
//! - A waiting `acquire` holds no tokens while suspended. Dropping the future
//!   (cancellation or deadline) leaves the bucket exactly as other callers
//!   left it.
//!
//! # Adaptive narrowing
//!
//! When the provider answers with a throttling error the caller reports it via
//! [`TokenBucket::on_throttled`]. The refill rate is halved (down to a floor) and
//! recovers linearly back to the configured rate over the recovery window.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

const NARROW_FACTOR: f64 = 0.5;
const MIN_RATE_FACTOR: f64 = 0.1;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AcquireError {
    #[error("timed out waiting for {requested} token(s)")]
    TimedOut { requested: u32 },
    #[error("requested {requested} token(s) but bucket capacity is {capacity}")]
    ExceedsCapacity { requested: u32, capacity: f64 },
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("limiter {name}: rate {rate_per_sec} and capacity {capacity} must be finite and positive")]
pub struct InvalidLimiter {
    pub name: String,
    pub rate_per_sec: f64,
    pub capacity: f64,
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
    rate_factor: f64,
}

#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    capacity: f64,
    rate_per_sec: f64,
    recovery: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate_per_sec` with a burst capacity of a
    /// single token, so calls are paced at `1 / rate` apart and no one-second
    /// window ever sees more than `ceil(rate)` grants. The bucket starts full.
    pub fn new(
        name: impl Into<String>,
        rate_per_sec: f64,
        recovery: Duration,
    ) -> Result<Self, InvalidLimiter> {
        Self::with_capacity(name, 1.0, rate_per_sec, recovery)
    }

    pub fn with_capacity(
        name: impl Into<String>,
        capacity: f64,
        rate_per_sec: f64,
        recovery: Duration,
    ) -> Result<Self, InvalidLimiter> {
        let name = name.into();
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(capacity) || !positive(rate_per_sec) {
            return Err(InvalidLimiter {
                name,
                rate_per_sec,
                capacity,
            });
        }
        Ok(Self {
            name,
            capacity,
            rate_per_sec,
            recovery,
            state: Mutex::new(BucketState {
                available: capacity,
                last_refill: Instant::now(),
                rate_factor: 1.0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }

    /// Current refill rate after adaptive narrowing.
    pub fn effective_rate(&self) -> f64 {
        let mut st = self.state.lock().unwrap();
        self.refill(&mut st, Instant::now());
        self.rate_per_sec * st.rate_factor
    }

    pub fn available(&self) -> f64 {
        let mut st = self.state.lock().unwrap();
        self.refill(&mut st, Instant::now());
        st.available
    }

    fn refill(&self, st: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(st.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let start_factor = st.rate_factor;
        let end_factor = if self.recovery.is_zero() {
            1.0
        } else {
            (start_factor + elapsed / self.recovery.as_secs_f64()).min(1.0)
        };
        // Linear recovery: credit the average factor over the interval. When the
        // factor saturates mid-interval this under-credits, never over-credits.
        let avg_factor = (start_factor + end_factor) / 2.0;
        st.available = (st.available + elapsed * self.rate_per_sec * avg_factor).min(self.capacity);
        st.rate_factor = end_factor;
        st.last_refill = now;
    }

    /// Try to take `n` tokens without waiting.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut st = self.state.lock().unwrap();
        self.refill(&mut st, Instant::now());
        let n = n as f64;
        if st.available >= n {
            st.available -= n;
            true
        } else {
            false
        }
    }

    /// Take `n` tokens, suspending until they are available or `deadline`
    /// passes. Returns the instant the tokens were granted.
    pub async fn acquire(&self, n: u32, deadline: Instant) -> Result<Instant, AcquireError> {
        let needed = n as f64;
        if needed > self.capacity {
            return Err(AcquireError::ExceedsCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }
        loop {
            let now = Instant::now();
            let wait = {
                let mut st = self.state.lock().unwrap();
                self.refill(&mut st, now);
                if st.available >= needed {
                    st.available -= needed;
                    return Ok(now);
                }
                let rate = self.rate_per_sec * st.rate_factor;
                Duration::from_secs_f64((needed - st.available) / rate)
            };
            if now >= deadline {
                return Err(AcquireError::TimedOut { requested: n });
            }
            // Competing acquirers may take the refilled tokens first, so the
            // loop re-checks after every wake.
            let wake = (now + wait.max(Duration::from_millis(1))).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Narrow the effective rate after the provider reported throttling.
    pub fn on_throttled(&self) {
        let mut st = self.state.lock().unwrap();
        self.refill(&mut st, Instant::now());
        st.rate_factor = (st.rate_factor * NARROW_FACTOR).max(MIN_RATE_FACTOR);
        tracing::debug!(
            limiter = %self.name,
            effective_rate = self.rate_per_sec * st.rate_factor,
            "narrowed limiter after throttling"
        );
    }
}

/// The independent limiters for each provider operation class.
#[derive(Debug)]
pub struct OperationLimiters {
    pub start: TokenBucket,
    pub poll: TokenBucket,
    pub detect: TokenBucket,
}

impl OperationLimiters {
    pub fn from_settings(quota: &crate::settings::QuotaSettings) -> Result<Self, InvalidLimiter> {
        let recovery = quota.adaptive_recovery();
        Ok(Self {
            start: TokenBucket::new("start", quota.start_rate(), recovery)?,
            poll: TokenBucket::new("poll", quota.poll_rate(), recovery)?,
            detect: TokenBucket::new("detect", quota.detect_rate(), recovery)?,
        })
    }
}
