//! Domain handlers plugged into the consumer pool.
//!
//! Each handler is a `{decode, dispatch}` capability set for the events one
//! service consumes.

pub mod accounts;
pub mod auth;

pub use accounts::{Account, AccountDirectory, AccountEventHandler, AccountService};
pub use auth::AckHandler;
