//! Shared atomic key-value service boundary.
//!
//! Rate-limit counters, mailbox leases, and campaign reputation counters are
//! shared mutable state across worker processes, so they live behind this
//! trait rather than in-process mutexes. Every method models ONE server-side
//! scripted operation: the backing store executes the whole read-modify-write
//! as a single indivisible step, never as separate round-trips.
//!
//! `now` is passed in explicitly so the arithmetic is testable with a fixed
//! clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SharedStoreError;

pub mod memory;

pub use memory::MemorySharedStore;

/// Outcome of a quota consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeDecision {
    Allowed,
    DailyQuotaExhausted,
    BucketEmpty,
}

/// Rolling per-campaign delivery reputation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReputationCounts {
    pub sent: u64,
    pub bounce_or_spam: u64,
}

impl ReputationCounts {
    /// Bounce-or-spam rate as a percentage of sends.
    pub fn rate_pct(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.bounce_or_spam as f64 / self.sent as f64 * 100.0
        }
    }
}

/// External atomic key-value service.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically check the daily window and token bucket for a mailbox and,
    /// if both allow, consume one token and bump the daily counter.
    ///
    /// The daily counter is keyed by UTC date and expires ~25 hours after its
    /// first increment; bucket state expires after 1 hour of inactivity.
    async fn try_consume(
        &self,
        mailbox_id: Uuid,
        daily_limit: u32,
        hourly_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<ConsumeDecision, SharedStoreError>;

    /// Read-only variant of [`try_consume`]: reports whether a send would
    /// currently be allowed without consuming anything. Used by the
    /// sequencer when picking a mailbox; the delivery worker performs the
    /// authoritative consume.
    ///
    /// [`try_consume`]: SharedStore::try_consume
    async fn can_send(
        &self,
        mailbox_id: Uuid,
        daily_limit: u32,
        hourly_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<ConsumeDecision, SharedStoreError>;

    /// Set-if-absent with expiry. Returns `true` if the lease was taken.
    async fn acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, SharedStoreError>;

    /// Delete the lease only if still held by `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, SharedStoreError>;

    /// Push the lease expiry forward only if still held by `token`.
    async fn extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, SharedStoreError>;

    /// Atomically add to a campaign's rolling reputation counters and return
    /// the updated totals.
    async fn record_outcome(
        &self,
        campaign_id: Uuid,
        sent: u64,
        bounce_or_spam: u64,
    ) -> Result<ReputationCounts, SharedStoreError>;
}
