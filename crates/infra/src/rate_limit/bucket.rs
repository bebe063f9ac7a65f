//! Token-bucket arithmetic, independent of where the bucket is stored.

use chrono::{DateTime, Utc};

use super::profile::RateLimitProfile;
use crate::queue::types::after;

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Fractional token count, `0 <= tokens <= burst`
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
}

impl BucketState {
    pub fn full(profile: &RateLimitProfile, now: DateTime<Utc>) -> Self {
        Self {
            tokens: f64::from(profile.burst),
            last_refill_at: now,
        }
    }
}

/// Result of one refill-and-take step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStep {
    pub allowed: bool,
    /// State to persist
    pub state: BucketState,
}

/// Refill `prev` up to `now`, then take one token if a whole one is available.
///
/// An absent bucket starts full. Time moving backwards refills nothing.
pub fn take(prev: Option<BucketState>, profile: &RateLimitProfile, now: DateTime<Utc>) -> BucketStep {
    let burst = f64::from(profile.burst);
    let prev = prev.unwrap_or_else(|| BucketState::full(profile, now));

    let elapsed = (now - prev.last_refill_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let mut tokens = (prev.tokens + elapsed * profile.refill_rate).clamp(0.0, burst);

    let allowed = tokens >= 1.0;
    if allowed {
        tokens -= 1.0;
    }

    BucketStep {
        allowed,
        state: BucketState {
            tokens,
            last_refill_at: now,
        },
    }
}

/// When the next whole token will be available.
pub fn reset_at(tokens: f64, profile: &RateLimitProfile, now: DateTime<Utc>) -> DateTime<Utc> {
    if tokens >= 1.0 {
        return now;
    }
    if profile.refill_rate <= 0.0 {
        // Never refills; the bucket is forgotten after the window instead.
        return after(now, profile.window);
    }
    // Float-to-int casts saturate, and `after` caps the delay.
    let wait_ms = ((1.0 - tokens) / profile.refill_rate * 1000.0).ceil() as u64;
    after(now, std::time::Duration::from_millis(wait_ms))
}
