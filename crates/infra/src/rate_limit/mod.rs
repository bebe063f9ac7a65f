//! Token-bucket admission control.
//!
//! - `RateLimitProfile`: burst, refill rate and idle window for a route class
//! - `bucket`: refill/take arithmetic
//! - `AdmissionStore`: atomic bucket storage (in-memory, or Redis behind the
//!   `redis` feature)
//! - `RateLimiter`: admission decisions, fail-open on store errors

pub mod bucket;
pub mod limiter;
pub mod profile;
pub mod store;

pub use bucket::{BucketState, BucketStep};
pub use limiter::{LimiterStats, RateLimitDecision, RateLimitError, RateLimiter};
pub use profile::{ProfileSpec, RateLimitProfile, RateLimitProfiles};
#[cfg(feature = "redis")]
pub use store::RedisAdmissionStore;
pub use store::{AdmissionStore, AdmissionStoreError, InMemoryAdmissionStore};
