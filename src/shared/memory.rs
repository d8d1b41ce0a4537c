//! In-process reference implementation of [`SharedStore`].
//!
//! Each trait method takes the inner mutex exactly once, making the whole
//! read-modify-write a single critical section — the in-process equivalent of
//! the scripted server-side operation a production deployment runs against
//! its external KV service. Expired entries are dropped lazily on access.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SharedStoreError;
use crate::limiter::{
    BucketState, BUCKET_IDLE_TTL, DAILY_COUNTER_TTL, daily_key, refill_bucket,
};
use crate::shared::{ConsumeDecision, ReputationCounts, SharedStore};

struct DailyCounter {
    count: u32,
    expires_at: DateTime<Utc>,
}

struct BucketEntry {
    state: BucketState,
    expires_at: DateTime<Utc>,
}

struct Lease {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    daily: HashMap<String, DailyCounter>,
    buckets: HashMap<Uuid, BucketEntry>,
    leases: HashMap<String, Lease>,
    reputation: HashMap<Uuid, ReputationCounts>,
}

/// Single-process shared store backed by a mutex.
#[derive(Default)]
pub struct MemorySharedStore {
    inner: Mutex<Inner>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chrono_ttl(ttl: Duration) -> chrono::Duration {
        chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
    }

    /// Shared body of `try_consume`/`can_send`. When `consume` is false no
    /// state is written.
    fn check(
        inner: &mut Inner,
        mailbox_id: Uuid,
        daily_limit: u32,
        hourly_limit: u32,
        now: DateTime<Utc>,
        consume: bool,
    ) -> ConsumeDecision {
        // 1. Fixed daily window.
        let key = daily_key(mailbox_id, now);
        let count = match inner.daily.get(&key) {
            Some(c) if c.expires_at > now => c.count,
            _ => 0,
        };
        if count >= daily_limit {
            return ConsumeDecision::DailyQuotaExhausted;
        }

        // 2. Token bucket refill. A missing or idle-expired bucket starts full.
        let bucket = match inner.buckets.get(&mailbox_id) {
            Some(entry) if entry.expires_at > now => {
                refill_bucket(entry.state, hourly_limit, now)
            }
            _ => BucketState::full(hourly_limit, now),
        };
        if bucket.tokens < 1.0 {
            return ConsumeDecision::BucketEmpty;
        }

        if consume {
            let bucket_ttl = Self::chrono_ttl(BUCKET_IDLE_TTL);
            inner.buckets.insert(
                mailbox_id,
                BucketEntry {
                    state: BucketState {
                        tokens: bucket.tokens - 1.0,
                        last_refill: bucket.last_refill,
                    },
                    expires_at: now + bucket_ttl,
                },
            );
            // Expiry is set only on the first increment of the day.
            let daily_ttl = Self::chrono_ttl(DAILY_COUNTER_TTL);
            inner
                .daily
                .entry(key)
                .and_modify(|c| {
                    if c.expires_at <= now {
                        c.count = 1;
                        c.expires_at = now + daily_ttl;
                    } else {
                        c.count += 1;
                    }
                })
                .or_insert(DailyCounter {
                    count: 1,
                    expires_at: now + daily_ttl,
                });
        }

        ConsumeDecision::Allowed
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, SharedStoreError> {
        self.inner
            .lock()
            .map_err(|_| SharedStoreError::Operation("shared store mutex poisoned".into()))
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn try_consume(
        &self,
        mailbox_id: Uuid,
        daily_limit: u32,
        hourly_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<ConsumeDecision, SharedStoreError> {
        let mut inner = self.lock()?;
        Ok(Self::check(
            &mut inner,
            mailbox_id,
            daily_limit,
            hourly_limit,
            now,
            true,
        ))
    }

    async fn can_send(
        &self,
        mailbox_id: Uuid,
        daily_limit: u32,
        hourly_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<ConsumeDecision, SharedStoreError> {
        let mut inner = self.lock()?;
        Ok(Self::check(
            &mut inner,
            mailbox_id,
            daily_limit,
            hourly_limit,
            now,
            false,
        ))
    }

    async fn acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, SharedStoreError> {
        let mut inner = self.lock()?;
        match inner.leases.get(key) {
            Some(lease) if lease.expires_at > now => Ok(false),
            _ => {
                inner.leases.insert(
                    key.to_string(),
                    Lease {
                        token: token.to_string(),
                        expires_at: now + Self::chrono_ttl(ttl),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, SharedStoreError> {
        let mut inner = self.lock()?;
        match inner.leases.get(key) {
            Some(lease) if lease.token == token => {
                inner.leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, SharedStoreError> {
        let mut inner = self.lock()?;
        match inner.leases.get_mut(key) {
            Some(lease) if lease.token == token && lease.expires_at > now => {
                lease.expires_at = now + Self::chrono_ttl(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_outcome(
        &self,
        campaign_id: Uuid,
        sent: u64,
        bounce_or_spam: u64,
    ) -> Result<ReputationCounts, SharedStoreError> {
        let mut inner = self.lock()?;
        let counts = inner.reputation.entry(campaign_id).or_default();
        counts.sent += sent;
        counts.bounce_or_spam += bounce_or_spam;
        Ok(*counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_756_500_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn daily_limit_two_allows_exactly_two() {
        let store = MemorySharedStore::new();
        let mb = Uuid::new_v4();
        let now = at(0);

        assert_eq!(
            store.try_consume(mb, 2, 100, now).await.unwrap(),
            ConsumeDecision::Allowed
        );
        assert_eq!(
            store.try_consume(mb, 2, 100, now).await.unwrap(),
            ConsumeDecision::Allowed
        );
        assert_eq!(
            store.try_consume(mb, 2, 100, now).await.unwrap(),
            ConsumeDecision::DailyQuotaExhausted
        );
    }

    #[tokio::test]
    async fn concurrent_consumers_respect_daily_limit() {
        let store = Arc::new(MemorySharedStore::new());
        let mb = Uuid::new_v4();
        let now = at(0);
        let daily = 5u32;

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.try_consume(mb, daily, 1000, now).await.unwrap()
            }));
        }

        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() == ConsumeDecision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, daily);
    }

    #[tokio::test]
    async fn bucket_empties_then_refills() {
        let store = MemorySharedStore::new();
        let mb = Uuid::new_v4();
        // hourly_limit 2: bucket starts with 2 tokens.
        assert_eq!(
            store.try_consume(mb, 100, 2, at(0)).await.unwrap(),
            ConsumeDecision::Allowed
        );
        assert_eq!(
            store.try_consume(mb, 100, 2, at(1)).await.unwrap(),
            ConsumeDecision::Allowed
        );
        assert_eq!(
            store.try_consume(mb, 100, 2, at(2)).await.unwrap(),
            ConsumeDecision::BucketEmpty
        );
        // 2/hour: one token back after 30 minutes.
        assert_eq!(
            store.try_consume(mb, 100, 2, at(2 + 1800)).await.unwrap(),
            ConsumeDecision::Allowed
        );
    }

    #[tokio::test]
    async fn daily_counter_resets_after_expiry() {
        let store = MemorySharedStore::new();
        let mb = Uuid::new_v4();
        assert_eq!(
            store.try_consume(mb, 1, 100, at(0)).await.unwrap(),
            ConsumeDecision::Allowed
        );
        assert_eq!(
            store.try_consume(mb, 1, 100, at(60)).await.unwrap(),
            ConsumeDecision::DailyQuotaExhausted
        );
        // Next UTC day, new key, fresh counter.
        assert_eq!(
            store
                .try_consume(mb, 1, 100, at(26 * 3600))
                .await
                .unwrap(),
            ConsumeDecision::Allowed
        );
    }

    #[tokio::test]
    async fn can_send_does_not_consume() {
        let store = MemorySharedStore::new();
        let mb = Uuid::new_v4();
        let now = at(0);
        for _ in 0..10 {
            assert_eq!(
                store.can_send(mb, 1, 100, now).await.unwrap(),
                ConsumeDecision::Allowed
            );
        }
        assert_eq!(
            store.try_consume(mb, 1, 100, now).await.unwrap(),
            ConsumeDecision::Allowed
        );
        assert_eq!(
            store.can_send(mb, 1, 100, now).await.unwrap(),
            ConsumeDecision::DailyQuotaExhausted
        );
    }

    #[tokio::test]
    async fn lease_acquire_is_exclusive_until_expiry() {
        let store = MemorySharedStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.acquire("mailbox:m1", "a", ttl, at(0)).await.unwrap());
        assert!(!store.acquire("mailbox:m1", "b", ttl, at(1)).await.unwrap());
        // Self-expires: a crashed holder's lease frees itself.
        assert!(store.acquire("mailbox:m1", "b", ttl, at(31)).await.unwrap());
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let store = MemorySharedStore::new();
        let ttl = Duration::from_secs(30);
        store.acquire("k", "a", ttl, at(0)).await.unwrap();

        assert!(!store.release("k", "b").await.unwrap());
        assert!(store.release("k", "a").await.unwrap());
        // Released: anyone may take it.
        assert!(store.acquire("k", "b", ttl, at(1)).await.unwrap());
    }

    #[tokio::test]
    async fn extend_pushes_expiry_for_holder_only() {
        let store = MemorySharedStore::new();
        let ttl = Duration::from_secs(30);
        store.acquire("k", "a", ttl, at(0)).await.unwrap();

        assert!(store.extend("k", "a", ttl, at(20)).await.unwrap());
        // Would have expired at t=30 without the extend.
        assert!(!store.acquire("k", "b", ttl, at(40)).await.unwrap());
        // Cannot extend an expired or foreign lease.
        assert!(!store.extend("k", "b", ttl, at(40)).await.unwrap());
    }

    #[tokio::test]
    async fn reputation_accumulates() {
        let store = MemorySharedStore::new();
        let c = Uuid::new_v4();
        store.record_outcome(c, 20, 0).await.unwrap();
        let counts = store.record_outcome(c, 1, 2).await.unwrap();
        assert_eq!(counts.sent, 21);
        assert_eq!(counts.bounce_or_spam, 2);
        assert!(counts.rate_pct() > 9.0 && counts.rate_pct() < 10.0);
    }
}
