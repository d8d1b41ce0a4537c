//! Distributed mutual-exclusion leases over the shared store.
//!
//! A worker must hold the mailbox lease before dispatching through it and
//! must release it on every exit path. TTLs bound the blast radius of a
//! crashed worker: an un-released lease self-expires in the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::shared::SharedStore;

/// A held lease. Opaque holder token, one per acquisition.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub token: String,
}

/// Lease manager for mailbox-scoped mutual exclusion.
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<dyn SharedStore>,
    ttl: Duration,
}

/// Resource key for a mailbox lease.
pub fn mailbox_key(mailbox_id: Uuid) -> String {
    format!("lock:mailbox:{mailbox_id}")
}

impl LockManager {
    pub fn new(shared: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { shared, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lease for `key`. `None` means another holder owns it
    /// — or the store is unreachable, which fail-closed also counts as held.
    pub async fn acquire(&self, key: &str) -> Option<Lease> {
        let token = Uuid::new_v4().to_string();
        match self
            .shared
            .acquire(key, &token, self.ttl, Utc::now())
            .await
        {
            Ok(true) => Some(Lease {
                key: key.to_string(),
                token,
            }),
            Ok(false) => None,
            Err(e) => {
                warn!(key, error = %e, "Lock store unreachable, treating lease as held");
                None
            }
        }
    }

    /// Push the lease expiry forward for long-running operations (IMAP
    /// scans). Returns false if the lease was lost.
    pub async fn extend(&self, lease: &Lease) -> bool {
        match self
            .shared
            .extend(&lease.key, &lease.token, self.ttl, Utc::now())
            .await
        {
            Ok(held) => held,
            Err(e) => {
                warn!(key = %lease.key, error = %e, "Lock store unreachable during extend");
                false
            }
        }
    }

    /// Release the lease. Best-effort: an expired or foreign lease is left
    /// alone, a store failure is logged (the TTL cleans up).
    pub async fn release(&self, lease: Lease) {
        match self.shared.release(&lease.key, &lease.token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(key = %lease.key, "Lease already expired or taken over at release");
            }
            Err(e) => {
                warn!(key = %lease.key, error = %e, "Lock store unreachable during release");
            }
        }
    }
}
