//! Twitchy - resilient broker client
//!
//! The messaging core shared by the twitchy account and auth services:
//! a self-healing AMQP connection, confirmed publishing, and a pool of
//! consumer workers with per-message acknowledgment and crash isolation.

pub mod broker;
pub mod config;
pub mod event;
pub mod handlers;
pub mod utils;
