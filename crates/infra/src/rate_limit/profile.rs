//! Named admission profiles.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use backlot_core::CoreError;

/// Longest idle window a bucket may be kept for.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Slowest non-zero refill accepted: one token per day.
pub const MIN_REFILL_RATE: f64 = 1.0 / 86_400.0;

/// Capacity and refill parameters for one class of caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitProfile {
    /// Bucket capacity
    pub burst: u32,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Idle time after which a bucket is forgotten
    pub window: Duration,
}

impl RateLimitProfile {
    pub fn new(burst: u32, refill_rate: f64, window: Duration) -> Self {
        Self {
            burst,
            refill_rate,
            window,
        }
    }

    /// `burst` tokens, refilled at `per_minute` tokens per minute.
    pub fn per_minute(burst: u32, per_minute: u32) -> Self {
        Self::new(burst, f64::from(per_minute) / 60.0, Duration::from_secs(60))
    }

    /// The bucket shared by every caller of one organisation.
    ///
    /// It holds a full window of refill (at least `burst`), so one caller can
    /// spend at most `burst` of the organisation's quota before its own bucket
    /// denies.
    pub fn org_wide(&self) -> Self {
        let per_window = (self.refill_rate * self.window.as_secs_f64()).round();
        let burst = if per_window >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            (per_window as u32).max(self.burst)
        };
        Self { burst, ..*self }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.burst == 0 {
            return Err(CoreError::validation("burst must be at least 1"));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(CoreError::validation(
                "refill_rate must be a non-negative number",
            ));
        }
        if self.refill_rate > 0.0 && self.refill_rate < MIN_REFILL_RATE {
            return Err(CoreError::validation(
                "refill_rate must be 0 or at least one token per day",
            ));
        }
        if self.window.is_zero() || self.window > MAX_WINDOW {
            return Err(CoreError::validation("window must be non-zero and at most 24h"));
        }
        Ok(())
    }
}

/// Wire form used in configuration overrides.
///
/// ```json
/// {"standard": {"burst": 40, "refill_per_minute": 200, "window_secs": 60}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub burst: u32,
    pub refill_per_minute: f64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl From<ProfileSpec> for RateLimitProfile {
    fn from(spec: ProfileSpec) -> Self {
        RateLimitProfile::new(
            spec.burst,
            spec.refill_per_minute / 60.0,
            Duration::from_secs(spec.window_secs),
        )
    }
}

/// The set of profiles callers can select by name.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitProfiles {
    profiles: BTreeMap<String, RateLimitProfile>,
}

impl Default for RateLimitProfiles {
    fn default() -> Self {
        let profiles = [
            (Self::LOW, RateLimitProfile::per_minute(10, 30)),
            (Self::STANDARD, RateLimitProfile::per_minute(20, 100)),
            (Self::HIGH, RateLimitProfile::per_minute(50, 300)),
            (Self::EXPENSIVE, RateLimitProfile::per_minute(2, 10)),
            (Self::ADMIN, RateLimitProfile::per_minute(10, 30)),
        ]
        .into_iter()
        .map(|(name, profile)| (name.to_string(), profile))
        .collect();
        Self { profiles }
    }
}

impl RateLimitProfiles {
    pub const LOW: &'static str = "low";
    pub const STANDARD: &'static str = "standard";
    pub const HIGH: &'static str = "high";
    pub const EXPENSIVE: &'static str = "expensive";
    pub const ADMIN: &'static str = "admin";

    pub fn get(&self, name: &str) -> Option<&RateLimitProfile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Add or replace a profile.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        profile: RateLimitProfile,
    ) -> Result<(), CoreError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::validation("profile name must not be empty"));
        }
        profile.validate()?;
        self.profiles.insert(name, profile);
        Ok(())
    }

    /// Apply overrides from a JSON object of `name → ProfileSpec`.
    ///
    /// Unknown names add new profiles; the built-ins stay unless replaced.
    pub fn with_json_overrides(mut self, json: &str) -> Result<Self, CoreError> {
        let overrides: BTreeMap<String, ProfileSpec> = serde_json::from_str(json)
            .map_err(|e| CoreError::validation(format!("invalid profile overrides: {e}")))?;
        for (name, spec) in overrides {
            self.insert(name.clone(), spec.into()).map_err(|e| {
                CoreError::validation(format!("profile '{name}': {e}"))
            })?;
        }
        Ok(self)
    }
}
