//! Infrastructure layer: task queue, dispatcher, rate limiting, config.

pub mod config;
pub mod dispatcher;
pub mod queue;
pub mod rate_limit;
