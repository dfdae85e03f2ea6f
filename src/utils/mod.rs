//! Process-wide helpers: tracing setup and backoff policy.

pub mod bootstrap;
pub mod retry;
