//! `backlot-core` — shared primitives for the task subsystem.
//!
//! This crate holds identifiers, the core error type and the clock
//! abstraction. It has no storage or runtime dependencies.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{TaskId, WorkerId};
