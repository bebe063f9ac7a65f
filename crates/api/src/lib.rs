//! HTTP API: task intake, queue inspection and rate-limited admission.

pub mod app;
pub mod middleware;
