//! Poller/dispatcher: turns due tasks into handler invocations.
//!
//! ## Flow
//!
//! 1. Select up to `batch_size` claimable tasks (bounded by free pool slots)
//! 2. Claim each one with a conditional update; lost races are skipped
//! 3. Run the resolved handler on its own tokio task, with a deadline
//! 4. Record `done`, a scheduled retry, or abandonment
//!
//! A periodic sweep returns tasks whose claim outlived the lease timeout
//! (crashed worker) to `failed` so they become claimable again.

pub mod executor;
pub mod handler;

pub use executor::{
    DispatchTrigger, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, PollReport,
};
pub use handler::{FnHandler, HandlerRegistry, TaskHandler};
