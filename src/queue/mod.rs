//! Durable delayed job queue over the persistent store.
//!
//! One logical queue per job type: `send`, `warmup`, `reply_fetch`,
//! `tracking`. Delivery is at-least-once — claiming marks a job `running`
//! atomically, but a crashed worker leaves it to be reset on startup, so
//! consumers must be idempotent. Failed jobs retry with exponential backoff
//! up to a bounded attempt count, then land in the dead `failed` state where
//! they stay auditable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, QueueError};
use crate::store::Database;

// ── Job model ───────────────────────────────────────────────────────

/// The four job types. There is deliberately no extension point here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Send,
    Warmup,
    ReplyFetch,
    Tracking,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Send => "send",
            JobKind::Warmup => "warmup",
            JobKind::ReplyFetch => "reply_fetch",
            JobKind::Tracking => "tracking",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "warmup" => JobKind::Warmup,
            "reply_fetch" => JobKind::ReplyFetch,
            "tracking" => JobKind::Tracking,
            _ => JobKind::Send,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    /// Dead state after exhausting attempts. Kept for manual triage.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "done" => JobStatus::Done,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Attempts so far, including the in-flight one once claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts,
            run_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deserialize the payload into its concrete job type.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| QueueError::Payload(format!("job {}: {e}", self.id)))
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// Send one sequenced step. The sending log was created at enqueue time and
/// carries everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendJob {
    pub log_id: Uuid,
}

/// One warm-up round for a workspace's opted-in mailboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupJob {
    pub workspace_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackEvent {
    Open,
    Click,
}

/// Record an open/click hit against a sending log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingJob {
    pub log_id: Uuid,
    pub event: TrackEvent,
}

/// Scan all active mailboxes for new replies. Recurring, fixed schedule,
/// independent of any single workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyFetchJob {}

// ── Backoff ─────────────────────────────────────────────────────────

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(30 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << shift);
        delay.min(self.cap)
    }
}

// ── Consumer contract ───────────────────────────────────────────────

/// What a consumer did with a job.
#[derive(Debug)]
pub enum JobOutcome {
    Done,
    /// Data-integrity skip: job completed without performing its work
    /// (missing lead, suppressed recipient). Not retried.
    Skipped(&'static str),
    /// Deliberate deferral (quota denied): re-queue after the delay without
    /// charging an attempt.
    Deferred(Duration),
}

/// A job consumer. Errors route through the queue's retry machinery;
/// at-least-once delivery means `handle` may run more than once per job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn handle(&self, job: &Job) -> Result<JobOutcome, Error>;
}

// ── Queue ───────────────────────────────────────────────────────────

/// Job submission and consumption over the durable store.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<dyn Database>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            db,
            max_attempts,
            backoff,
        }
    }

    /// Enqueue a job to run after `delay`.
    pub async fn enqueue<T: Serialize>(
        &self,
        kind: JobKind,
        payload: &T,
        delay: Duration,
    ) -> Result<Uuid, QueueError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::Payload(e.to_string()))?;
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let job = Job::new(kind, payload, run_at, self.max_attempts);
        let id = job.id;
        self.db.insert_job(&job).await?;
        debug!(job_id = %id, kind = kind.as_str(), run_at = %run_at, "Job enqueued");
        Ok(id)
    }

    /// Spawn `concurrency` consumer tasks for the handler's queue.
    pub fn spawn_consumers(
        &self,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Vec<JoinHandle<()>> {
        (0..concurrency)
            .map(|worker_idx| {
                let queue = self.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let kind = handler.kind();
                    info!(kind = kind.as_str(), worker_idx, "Queue consumer started");
                    loop {
                        match queue.db.claim_due_jobs(kind, 1, Utc::now()).await {
                            Ok(jobs) if jobs.is_empty() => {
                                tokio::time::sleep(poll_interval).await;
                            }
                            Ok(jobs) => {
                                for job in jobs {
                                    queue.run_one(handler.as_ref(), &job).await;
                                }
                            }
                            Err(e) => {
                                warn!(kind = kind.as_str(), error = %e, "Job claim failed");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Spawn a ticker that enqueues a job on a cron schedule. Used for the
    /// recurring reply-fetch sweep.
    pub fn spawn_recurring(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        schedule: cron::Schedule,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            info!(kind = kind.as_str(), "Recurring job ticker started");
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!(kind = kind.as_str(), "Cron schedule has no upcoming fire time");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                let job = Job::new(kind, payload.clone(), Utc::now(), queue.max_attempts);
                if let Err(e) = queue.db.insert_job(&job).await {
                    warn!(kind = kind.as_str(), error = %e, "Failed to enqueue recurring job");
                }
            }
        })
    }

    /// Run one claimed job through its handler and record the outcome.
    async fn run_one(&self, handler: &dyn JobHandler, job: &Job) {
        match handler.handle(job).await {
            Ok(JobOutcome::Done) => {
                if let Err(e) = self.db.complete_job(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to mark job done");
                }
            }
            Ok(JobOutcome::Skipped(reason)) => {
                info!(job_id = %job.id, reason, "Job skipped");
                if let Err(e) = self.db.complete_job(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to mark skipped job done");
                }
            }
            Ok(JobOutcome::Deferred(delay)) => {
                let run_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                debug!(job_id = %job.id, run_at = %run_at, "Job deferred");
                if let Err(e) = self.db.reschedule_job(job.id, run_at).await {
                    warn!(job_id = %job.id, error = %e, "Failed to defer job");
                }
            }
            Err(e) => {
                let msg = e.to_string();
                if job.attempts >= job.max_attempts {
                    error!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %msg,
                        "Job exhausted attempts, routing to failed state"
                    );
                    if let Err(e) = self.db.bury_job(job.id, &msg).await {
                        warn!(job_id = %job.id, error = %e, "Failed to bury job");
                    }
                } else {
                    let delay = self.backoff.delay(job.attempts);
                    let run_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        transient = e.is_transient(),
                        retry_at = %run_at,
                        error = %msg,
                        "Job failed, scheduling retry"
                    );
                    if let Err(e) = self.db.retry_job(job.id, &msg, run_at).await {
                        warn!(job_id = %job.id, error = %e, "Failed to schedule retry");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::store::LibSqlBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn queue() -> (JobQueue, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let backoff = BackoffPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(100),
        };
        (JobQueue::new(Arc::clone(&db), 3, backoff), db)
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        outcome: fn() -> JobOutcome,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn kind(&self) -> JobKind {
            JobKind::Tracking
        }

        async fn handle(&self, _job: &Job) -> Result<JobOutcome, Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::Worker(WorkerError::LockContended {
                    mailbox_id: Uuid::new_v4(),
                }));
            }
            Ok((self.outcome)())
        }
    }

    #[tokio::test]
    async fn enqueue_then_claim() {
        let (queue, db) = queue().await;
        let id = queue
            .enqueue(
                JobKind::Tracking,
                &TrackingJob {
                    log_id: Uuid::new_v4(),
                    event: TrackEvent::Open,
                },
                Duration::ZERO,
            )
            .await
            .unwrap();

        let claimed = db
            .claim_due_jobs(JobKind::Tracking, 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert_eq!(claimed[0].attempts, 1);

        // Already claimed: a second worker gets nothing.
        let again = db
            .claim_due_jobs(JobKind::Tracking, 10, Utc::now())
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn delayed_job_is_not_due_yet() {
        let (queue, db) = queue().await;
        queue
            .enqueue(
                JobKind::Tracking,
                &ReplyFetchJob::default(),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        let claimed = db
            .claim_due_jobs(JobKind::Tracking, 10, Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn queues_are_isolated_by_kind() {
        let (queue, db) = queue().await;
        queue
            .enqueue(JobKind::Send, &SendJob { log_id: Uuid::new_v4() }, Duration::ZERO)
            .await
            .unwrap();

        let claimed = db
            .claim_due_jobs(JobKind::Warmup, 10, Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn failed_job_retries_then_buries() {
        let (queue, db) = queue().await;
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            outcome: || JobOutcome::Done,
        };

        queue
            .enqueue(
                JobKind::Tracking,
                &TrackingJob {
                    log_id: Uuid::new_v4(),
                    event: TrackEvent::Open,
                },
                Duration::ZERO,
            )
            .await
            .unwrap();

        // Drive three attempts by hand; backoff delays are milliseconds.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let jobs = db
                .claim_due_jobs(JobKind::Tracking, 1, Utc::now())
                .await
                .unwrap();
            if let Some(job) = jobs.first() {
                queue.run_one(&handler, job).await;
            }
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            db.count_jobs(JobKind::Tracking, JobStatus::Failed)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let (queue, db) = queue().await;
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 1,
            outcome: || JobOutcome::Done,
        };

        queue
            .enqueue(
                JobKind::Tracking,
                &TrackingJob {
                    log_id: Uuid::new_v4(),
                    event: TrackEvent::Click,
                },
                Duration::ZERO,
            )
            .await
            .unwrap();

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let jobs = db
                .claim_due_jobs(JobKind::Tracking, 1, Utc::now())
                .await
                .unwrap();
            if let Some(job) = jobs.first() {
                queue.run_one(&handler, job).await;
            }
        }

        assert_eq!(
            db.count_jobs(JobKind::Tracking, JobStatus::Done)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn deferred_job_does_not_charge_an_attempt() {
        let (queue, db) = queue().await;
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
            outcome: || JobOutcome::Deferred(Duration::ZERO),
        };

        let id = queue
            .enqueue(
                JobKind::Tracking,
                &TrackingJob {
                    log_id: Uuid::new_v4(),
                    event: TrackEvent::Open,
                },
                Duration::ZERO,
            )
            .await
            .unwrap();

        let jobs = db
            .claim_due_jobs(JobKind::Tracking, 1, Utc::now())
            .await
            .unwrap();
        queue.run_one(&handler, &jobs[0]).await;

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0, "deferral refunds the claim's attempt");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(300),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(2), Duration::from_secs(60));
        assert_eq!(policy.delay(3), Duration::from_secs(120));
        assert_eq!(policy.delay(4), Duration::from_secs(240));
        assert_eq!(policy.delay(5), Duration::from_secs(300));
        assert_eq!(policy.delay(60), Duration::from_secs(300));
    }

    #[test]
    fn job_kind_roundtrip() {
        for k in [
            JobKind::Send,
            JobKind::Warmup,
            JobKind::ReplyFetch,
            JobKind::Tracking,
        ] {
            assert_eq!(JobKind::parse_str(k.as_str()), k);
        }
    }
}
