//! Shared helpers.
//!
//! Tracing and signal bootstrap for binaries, and reconnect backoff policies.

pub mod bootstrap;
pub mod retry;
