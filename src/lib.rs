//! Outflow — cold-outreach delivery core.
//!
//! Campaign sequencing, per-mailbox rate limiting, durable job delivery
//! over SMTP, and inbound reconciliation of replies, bounces, and spam
//! complaints.

pub mod alert;
pub mod compose;
pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod lock;
pub mod model;
pub mod provider;
pub mod queue;
pub mod reconcile;
pub mod scheduler;
pub mod sequencer;
pub mod shared;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
