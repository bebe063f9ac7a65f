//! Admission decisions on top of an [`AdmissionStore`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use backlot_core::{Clock, SystemClock};

use super::bucket;
use super::profile::{RateLimitProfile, RateLimitProfiles};
use super::store::AdmissionStore;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole tokens left after this check
    pub remaining: u32,
    /// When the next token is available (`now` if one already is)
    pub reset_at: DateTime<Utc>,
    /// Capacity of the profile applied
    pub limit: u32,
    /// The store could not be reached and the check failed open
    pub degraded: bool,
}

impl RateLimitDecision {
    /// How long a denied caller should wait before retrying.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("unknown rate limit profile: {0}")]
    UnknownProfile(String),
}

/// Counters since the limiter was built, one per bucket checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub allowed: u64,
    pub denied: u64,
    /// Checks answered without the store (fail-open)
    pub degraded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
}

/// Token-bucket rate limiter.
///
/// Every check is a single atomic round trip to the store; nothing about a
/// bucket is cached in-process, so any number of limiters may share a store.
/// When the store fails the check is admitted (fail open): an outage of the
/// limiter backend must not take the protected operation down with it.
pub struct RateLimiter<S> {
    store: S,
    profiles: Arc<RateLimitProfiles>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

impl<S: Clone> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            profiles: self.profiles.clone(),
            clock: self.clock.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<S: AdmissionStore> RateLimiter<S> {
    pub fn new(store: S, profiles: RateLimitProfiles) -> Self {
        Self::with_clock(store, profiles, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, profiles: RateLimitProfiles, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            profiles: Arc::new(profiles),
            clock,
            counters: Arc::default(),
        }
    }

    pub fn profiles(&self) -> &RateLimitProfiles {
        &self.profiles
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
        }
    }

    /// Check `key` against a named profile.
    ///
    /// Buckets are namespaced by profile name, so one caller gets an
    /// independent bucket per route class.
    pub async fn check(
        &self,
        profile_name: &str,
        key: &str,
    ) -> Result<RateLimitDecision, RateLimitError> {
        self.check_scoped(profile_name, key, None).await
    }

    /// Check a caller, and the organisation it acts for when there is one.
    ///
    /// The caller's bucket uses the profile as-is; the organisation's bucket
    /// uses [`RateLimitProfile::org_wide`] and is shared by all its callers.
    /// Both must admit. The caller's bucket is checked first, so a caller
    /// over its own limit never spends the organisation's tokens.
    pub async fn check_scoped(
        &self,
        profile_name: &str,
        caller: &str,
        org: Option<&str>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let profile = *self
            .profiles
            .get(profile_name)
            .ok_or_else(|| RateLimitError::UnknownProfile(profile_name.to_string()))?;

        let personal = self
            .check_and_consume(&format!("{profile_name}:{caller}"), &profile)
            .await;
        let Some(org) = org else {
            return Ok(personal);
        };
        if !personal.allowed {
            return Ok(personal);
        }

        let shared = self
            .check_and_consume(&format!("{profile_name}/org:{org}"), &profile.org_wide())
            .await;
        let degraded = personal.degraded || shared.degraded;
        let decision = if !shared.allowed || shared.remaining < personal.remaining {
            shared
        } else {
            personal
        };
        Ok(RateLimitDecision { degraded, ..decision })
    }

    /// Refill the bucket for `key` and try to take one token.
    #[instrument(skip(self, profile), fields(burst = profile.burst))]
    pub async fn check_and_consume(&self, key: &str, profile: &RateLimitProfile) -> RateLimitDecision {
        let now = self.clock.now();

        match self.store.take(key, profile, now).await {
            Ok(step) => {
                let tokens = step.state.tokens;
                let decision = RateLimitDecision {
                    allowed: step.allowed,
                    remaining: tokens.floor().max(0.0) as u32,
                    reset_at: bucket::reset_at(tokens, profile, now),
                    limit: profile.burst,
                    degraded: false,
                };
                if decision.allowed {
                    self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.denied.fetch_add(1, Ordering::Relaxed);
                    debug!(reset_at = %decision.reset_at, "rate limited");
                }
                decision
            }
            Err(e) => {
                self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "admission store failed; allowing request (degraded)");
                RateLimitDecision {
                    allowed: true,
                    remaining: profile.burst,
                    reset_at: now,
                    limit: profile.burst,
                    degraded: true,
                }
            }
        }
    }
}
