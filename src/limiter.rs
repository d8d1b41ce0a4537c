//! Per-mailbox quota enforcement: UTC-day fixed window + token bucket.
//!
//! The arithmetic here is pure; the atomicity lives in the [`SharedStore`]
//! implementation, which runs the whole check-and-update as one scripted
//! operation. The [`QuotaStore`] wrapper adds the fail-closed policy: if the
//! shared store is unreachable, the answer is deny. Under-sending is
//! recoverable; a provider ban is not.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::model::Mailbox;
use crate::shared::{ConsumeDecision, SharedStore};

/// Daily counters outlive the UTC day they count by one hour, so a scan
/// straddling midnight still sees the old window.
pub const DAILY_COUNTER_TTL: Duration = Duration::from_secs(25 * 3600);

/// Bucket state is dropped after an hour of inactivity; a fresh bucket
/// starts full.
pub const BUCKET_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Token bucket state for one mailbox.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
}

impl BucketState {
    /// A fresh bucket starts at capacity.
    pub fn full(hourly_limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            tokens: f64::from(hourly_limit),
            last_refill: now,
        }
    }
}

/// Refill a bucket proportionally to elapsed time, capped at capacity.
///
/// `tokens_to_add = elapsed_ms * hourly_limit / 3_600_000`.
pub fn refill_bucket(state: BucketState, hourly_limit: u32, now: DateTime<Utc>) -> BucketState {
    let elapsed_ms = (now - state.last_refill).num_milliseconds().max(0) as f64;
    let added = elapsed_ms * f64::from(hourly_limit) / 3_600_000.0;
    BucketState {
        tokens: (state.tokens + added).min(f64::from(hourly_limit)),
        last_refill: now,
    }
}

/// Key for the fixed-window daily counter: `UTC-date:mailbox-id`.
pub fn daily_key(mailbox_id: Uuid, now: DateTime<Utc>) -> String {
    format!("{}:{}", now.format("%Y-%m-%d"), mailbox_id)
}

/// Why a send was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The UTC-day counter reached the mailbox's daily limit.
    DailyQuota,
    /// The token bucket has less than one token.
    BucketEmpty,
    /// The shared store could not be reached; fail-closed.
    StoreUnavailable,
}

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPermit {
    Allowed,
    Denied(DenyReason),
}

impl SendPermit {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SendPermit::Allowed)
    }
}

/// Fail-closed quota enforcement over the shared atomic store.
#[derive(Clone)]
pub struct QuotaStore {
    shared: Arc<dyn SharedStore>,
}

impl QuotaStore {
    pub fn new(shared: Arc<dyn SharedStore>) -> Self {
        Self { shared }
    }

    /// Consume one send slot for the mailbox, or report why not.
    pub async fn try_consume(&self, mailbox: &Mailbox, now: DateTime<Utc>) -> SendPermit {
        match self
            .shared
            .try_consume(mailbox.id, mailbox.daily_limit, mailbox.hourly_limit, now)
            .await
        {
            Ok(ConsumeDecision::Allowed) => SendPermit::Allowed,
            Ok(ConsumeDecision::DailyQuotaExhausted) => SendPermit::Denied(DenyReason::DailyQuota),
            Ok(ConsumeDecision::BucketEmpty) => SendPermit::Denied(DenyReason::BucketEmpty),
            Err(e) => {
                warn!(mailbox_id = %mailbox.id, error = %e, "Quota store unreachable, denying send");
                SendPermit::Denied(DenyReason::StoreUnavailable)
            }
        }
    }

    /// Non-consuming availability check for mailbox selection.
    pub async fn can_send(&self, mailbox: &Mailbox, now: DateTime<Utc>) -> SendPermit {
        match self
            .shared
            .can_send(mailbox.id, mailbox.daily_limit, mailbox.hourly_limit, now)
            .await
        {
            Ok(ConsumeDecision::Allowed) => SendPermit::Allowed,
            Ok(ConsumeDecision::DailyQuotaExhausted) => SendPermit::Denied(DenyReason::DailyQuota),
            Ok(ConsumeDecision::BucketEmpty) => SendPermit::Denied(DenyReason::BucketEmpty),
            Err(e) => {
                warn!(mailbox_id = %mailbox.id, error = %e, "Quota store unreachable, denying send");
                SendPermit::Denied(DenyReason::StoreUnavailable)
            }
        }
    }
}
