use std::time::Duration;

use rand::Rng;

use crate::classify::ErrorClass;
use crate::settings::{BackoffSettings, RetryCurveSettings};

/// Exponential retry curve for one retryable error class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryCurve {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Number of failures tolerated; the failure after that is final
    pub max_attempts: u32,
}

impl RetryCurve {
    pub const BACKOFF_FACTOR: u32 = 2;

    /// Un-jittered delay for the `attempt`-th failure (1-based):
    /// `min(max_delay, base * 2^(attempt-1))`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = Self::BACKOFF_FACTOR.saturating_pow(exp);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Full-jitter delay for the `attempt`-th failure, drawn from
    /// `[0, ceiling(attempt)]`. The attempt cap is not consulted.
    pub fn jittered(&self, attempt: u32) -> Duration {
        self.jittered_with(attempt, &mut rand::rng())
    }

    pub fn jittered_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rng.random_range(0..=ceiling_ms))
    }
}

impl From<RetryCurveSettings> for RetryCurve {
    fn from(s: RetryCurveSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            max_attempts: s.max_attempts,
        }
    }
}

/// Decision for a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    NoRetry(NoRetryReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoRetryReason {
    /// The error class is never retried
    Permanent,
    /// Retryable, but the attempt budget for the class ran out
    Exhausted,
}

/// Retry policy keyed by error class.
///
/// Throttled and Transient errors follow the same doubling curve with their own
/// base delay and attempt cap. Every delay is drawn uniformly from
/// `[0, ceiling]` ("full jitter") so that documents failing together do not
/// retry together.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub throttled: RetryCurve,
    pub transient: RetryCurve,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self {
            throttled: settings.throttled.into(),
            transient: settings.transient.into(),
        }
    }

    pub fn curve(&self, class: ErrorClass) -> Option<&RetryCurve> {
        match class {
            ErrorClass::Throttled => Some(&self.throttled),
            ErrorClass::Transient => Some(&self.transient),
            ErrorClass::Permanent => None,
        }
    }

    /// Un-jittered upper bound on the delay for the `attempt`-th failure.
    pub fn ceiling(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        self.curve(class).map(|c| c.ceiling(attempt))
    }

    /// Decide whether and when to retry after the `attempt`-th failure of
    /// `class` (1-based, counting this failure).
    pub fn next_delay(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        self.next_delay_with(class, attempt, &mut rand::rng())
    }

    /// Same as [`BackoffPolicy::next_delay`] with an explicit jitter source.
    pub fn next_delay_with<R: Rng>(
        &self,
        class: ErrorClass,
        attempt: u32,
        rng: &mut R,
    ) -> RetryDecision {
        let Some(curve) = self.curve(class) else {
            return RetryDecision::NoRetry(NoRetryReason::Permanent);
        };
        if attempt > curve.max_attempts {
            return RetryDecision::NoRetry(NoRetryReason::Exhausted);
        }
        RetryDecision::RetryAfter(curve.jittered_with(attempt, rng))
    }
}
