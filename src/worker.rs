//! Job handlers: outbound delivery, warm-up rounds, tracking hits, and the
//! inbox fetch scan.
//!
//! Each handler maps its result onto the queue's outcome vocabulary:
//! `Done` for completed work, `Skipped` for data-integrity dead ends that
//! must not retry, `Deferred` for deliberate waits (quota denials), and
//! `Err` for genuine failures the queue retries with backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertKind, AlertSender, AlertSeverity};
use crate::compose::{ComposeFlags, Composer};
use crate::error::{Error, ProviderError, ReconcileError, WorkerError};
use crate::limiter::{DenyReason, QuotaStore, SendPermit};
use crate::lock::{mailbox_key, LockManager};
use crate::model::{
    Campaign, CampaignStatus, Lead, LeadStatus, LogStatus, Mailbox, MailboxStatus, SendingLog,
    SequenceStep,
};
use crate::provider::{correlation_message_id, OutboundEmail, ProviderAdapter};
use crate::queue::{JobHandler, JobKind, JobOutcome, SendJob, TrackEvent, TrackingJob, WarmupJob};
use crate::reconcile::{Reconciler, ReputationMonitor};
use crate::shared::SharedStore;
use crate::store::Database;

/// How long to wait after a quota denial before the job runs again.
fn deny_delay(reason: DenyReason, now: DateTime<Utc>) -> Duration {
    match reason {
        // The daily window resets at UTC midnight; add slack so the retry
        // lands inside the new window.
        DenyReason::DailyQuota => {
            let next_window = (now + chrono::Duration::days(1))
                .date_naive()
                .and_time(NaiveTime::MIN)
                .and_utc();
            (next_window - now)
                .to_std()
                .unwrap_or(Duration::from_secs(3600))
                + Duration::from_secs(60)
        }
        DenyReason::BucketEmpty => Duration::from_secs(300),
        DenyReason::StoreUnavailable => Duration::from_secs(120),
    }
}

// ── Send worker ─────────────────────────────────────────────────────

/// Executes one scheduled send: lock, quota, compose, dispatch, record.
pub struct SendWorker {
    db: Arc<dyn Database>,
    shared: Arc<dyn SharedStore>,
    quota: QuotaStore,
    locks: LockManager,
    composer: Composer,
    provider: Arc<dyn ProviderAdapter>,
    reputation: ReputationMonitor,
}

impl SendWorker {
    pub fn new(
        db: Arc<dyn Database>,
        shared: Arc<dyn SharedStore>,
        locks: LockManager,
        composer: Composer,
        provider: Arc<dyn ProviderAdapter>,
        reputation: ReputationMonitor,
    ) -> Self {
        Self {
            db,
            quota: QuotaStore::new(Arc::clone(&shared)),
            shared,
            locks,
            composer,
            provider,
            reputation,
        }
    }

    /// Load and validate everything the send needs. `Err(reason)` means the
    /// send can never succeed and the log should be closed out.
    async fn load_context(
        &self,
        log: &SendingLog,
    ) -> Result<Result<SendContext, &'static str>, Error> {
        let Some(lead) = self.db.get_lead(log.lead_id).await? else {
            return Ok(Err("lead no longer exists"));
        };
        if lead.status.is_suppressed() {
            return Ok(Err("lead is suppressed"));
        }
        let Some(campaign) = self.db.get_campaign(log.campaign_id).await? else {
            return Ok(Err("campaign no longer exists"));
        };
        if campaign.status != CampaignStatus::Active {
            return Ok(Err("campaign is not active"));
        }
        let Some(mailbox) = self.db.get_mailbox(log.mailbox_id).await? else {
            return Ok(Err("mailbox no longer exists"));
        };
        if mailbox.status != MailboxStatus::Active {
            return Ok(Err("mailbox is not active"));
        }
        let steps = self.db.list_steps(campaign.id).await?;
        let Some(step) = steps.into_iter().find(|s| s.id == log.step_id) else {
            return Ok(Err("step no longer exists"));
        };
        Ok(Ok(SendContext {
            lead,
            campaign,
            mailbox,
            step,
        }))
    }

    /// The lease-held section: quota, compose, dispatch, record.
    async fn dispatch(&self, log: &SendingLog, ctx: &SendContext) -> Result<JobOutcome, Error> {
        // An unsubscribe or complaint can land between validation and the
        // lease grant; the suppression check has to happen under the lock.
        if let Some(lead) = self.db.get_lead(ctx.lead.id).await?
            && lead.status.is_suppressed()
        {
            self.db.mark_log_skipped(log.id, "lead is suppressed").await?;
            return Ok(JobOutcome::Skipped("lead is suppressed"));
        }

        let now = Utc::now();
        if let SendPermit::Denied(reason) = self.quota.try_consume(&ctx.mailbox, now).await {
            let delay = deny_delay(reason, now);
            debug!(
                mailbox_id = %ctx.mailbox.id,
                reason = ?reason,
                delay_secs = delay.as_secs(),
                "Quota denied, deferring send"
            );
            return Ok(JobOutcome::Deferred(delay));
        }

        let flags = ComposeFlags {
            track_opens: ctx.campaign.settings.track_opens,
            track_clicks: ctx.campaign.settings.track_clicks,
        };
        let mut rng = StdRng::from_entropy();
        let composed = self
            .composer
            .compose(&ctx.step, &ctx.lead, log.id, flags, &mut rng);
        let email = OutboundEmail {
            to: ctx.lead.email.clone(),
            subject: composed.subject,
            html_body: composed.html_body,
            message_id: correlation_message_id(log.id),
            unsubscribe_url: Some(self.composer.unsubscribe_url(ctx.lead.id)),
        };

        match self.provider.send(&ctx.mailbox, &email).await {
            Ok(receipt) => {
                self.db
                    .mark_log_sent(log.id, &receipt.provider_message_id, receipt.accepted_at)
                    .await?;
                self.db
                    .update_lead_status_if_stronger(ctx.lead.id, LeadStatus::Sent)
                    .await?;
                match self.shared.record_outcome(ctx.campaign.id, 1, 0).await {
                    Ok(counts) => {
                        // A send grows the sample, and the one that clears
                        // the minimum-sample floor can itself expose a rate
                        // already over the pause threshold.
                        if let Err(e) = self
                            .reputation
                            .evaluate(ctx.campaign.workspace_id, ctx.campaign.id, counts)
                            .await
                        {
                            warn!(campaign_id = %ctx.campaign.id, error = %e, "Bounce-rate check failed");
                        }
                    }
                    Err(e) => {
                        warn!(campaign_id = %ctx.campaign.id, error = %e, "Reputation counter unavailable");
                    }
                }
                info!(
                    log_id = %log.id,
                    lead = %ctx.lead.email,
                    mailbox = %ctx.mailbox.email,
                    "Sent sequence step"
                );
                Ok(JobOutcome::Done)
            }
            Err(e) => {
                self.db.mark_log_failed(log.id, &e.to_string()).await?;
                if matches!(e, ProviderError::InvalidAddress { .. }) {
                    // Retrying a malformed address burns quota for nothing.
                    self.db
                        .update_lead_status_if_stronger(ctx.lead.id, LeadStatus::Bounced)
                        .await?;
                    return Ok(JobOutcome::Skipped("recipient address rejected"));
                }
                Err(e.into())
            }
        }
    }
}

struct SendContext {
    lead: Lead,
    campaign: Campaign,
    mailbox: Mailbox,
    step: SequenceStep,
}

#[async_trait]
impl JobHandler for SendWorker {
    fn kind(&self) -> JobKind {
        JobKind::Send
    }

    async fn handle(&self, job: &crate::queue::Job) -> Result<JobOutcome, Error> {
        let payload: SendJob = job.parse_payload()?;
        let Some(log) = self.db.get_log(payload.log_id).await? else {
            return Ok(JobOutcome::Skipped("sending log no longer exists"));
        };
        // Queued is the normal path; Failed means a retry of this same job.
        // Sent or Skipped means a previous attempt already finished the work
        // and the acknowledgement got lost.
        if matches!(log.status, LogStatus::Sent | LogStatus::Skipped) {
            return Ok(JobOutcome::Skipped("log already finalized"));
        }

        let ctx = match self.load_context(&log).await? {
            Ok(ctx) => ctx,
            Err(reason) => {
                self.db.mark_log_skipped(log.id, reason).await?;
                return Ok(JobOutcome::Skipped(reason));
            }
        };

        let Some(lease) = self.locks.acquire(&mailbox_key(ctx.mailbox.id)).await else {
            return Err(WorkerError::LockContended {
                mailbox_id: ctx.mailbox.id,
            }
            .into());
        };
        let result = self.dispatch(&log, &ctx).await;
        self.locks.release(lease).await;
        result
    }
}

// ── Warm-up worker ──────────────────────────────────────────────────

const WARMUP_SUBJECTS: &[&str] = &[
    "Quick check-in",
    "Following up on our chat",
    "Notes from this week",
    "One more thing",
];

const WARMUP_BODIES: &[&str] = &[
    "<p>Hi, just circling back on the thread from earlier. Talk soon.</p>",
    "<p>Sharing the notes we discussed. Let me know if anything is missing.</p>",
    "<p>Thanks again for the quick turnaround on this.</p>",
    "<p>All set on my end. Have a good one.</p>",
];

/// Sends benign round-robin mail between a workspace's opted-in mailboxes
/// to build sending reputation. Warm-up traffic consumes quota like real
/// sends but writes no sending logs and carries no correlation token, so
/// the fetch scan sees the replies as ordinary unresolvable mail.
pub struct WarmupWorker {
    db: Arc<dyn Database>,
    quota: QuotaStore,
    locks: LockManager,
    provider: Arc<dyn ProviderAdapter>,
}

impl WarmupWorker {
    pub fn new(
        db: Arc<dyn Database>,
        shared: Arc<dyn SharedStore>,
        locks: LockManager,
        provider: Arc<dyn ProviderAdapter>,
    ) -> Self {
        Self {
            db,
            quota: QuotaStore::new(shared),
            locks,
            provider,
        }
    }

    async fn send_one(&self, from: &Mailbox, to: &Mailbox) -> Result<bool, Error> {
        let now = Utc::now();
        let Some(lease) = self.locks.acquire(&mailbox_key(from.id)).await else {
            return Ok(false);
        };
        let result = async {
            if !self.quota.try_consume(from, now).await.is_allowed() {
                return Ok(false);
            }
            let mut rng = StdRng::from_entropy();
            let email = OutboundEmail {
                to: to.email.clone(),
                subject: WARMUP_SUBJECTS[rng.gen_range(0..WARMUP_SUBJECTS.len())].to_string(),
                html_body: WARMUP_BODIES[rng.gen_range(0..WARMUP_BODIES.len())].to_string(),
                // Random local part: never parses as a correlation token.
                message_id: format!("warm-{}@outflow.local", Uuid::new_v4().simple()),
                unsubscribe_url: None,
            };
            self.provider.send(from, &email).await?;
            Ok::<bool, Error>(true)
        }
        .await;
        self.locks.release(lease).await;
        result
    }
}

#[async_trait]
impl JobHandler for WarmupWorker {
    fn kind(&self) -> JobKind {
        JobKind::Warmup
    }

    async fn handle(&self, job: &crate::queue::Job) -> Result<JobOutcome, Error> {
        let payload: WarmupJob = job.parse_payload()?;
        let mailboxes: Vec<Mailbox> = self
            .db
            .list_mailboxes(payload.workspace_id)
            .await?
            .into_iter()
            .filter(|m| m.status == MailboxStatus::Active && m.warmup_enabled)
            .collect();
        if mailboxes.len() < 2 {
            return Ok(JobOutcome::Skipped("fewer than two warm-up mailboxes"));
        }

        let mut sent = 0u32;
        for (i, from) in mailboxes.iter().enumerate() {
            let to = &mailboxes[(i + 1) % mailboxes.len()];
            match self.send_one(from, to).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(mailbox = %from.email, error = %e, "Warm-up send failed");
                }
            }
        }
        info!(
            workspace_id = %payload.workspace_id,
            sent,
            pool = mailboxes.len(),
            "Warm-up round finished"
        );
        Ok(JobOutcome::Done)
    }
}

// ── Tracking worker ─────────────────────────────────────────────────

/// Records open/click hits against the sending log and nudges the lead
/// forward. First hit wins; later hits are absorbed by the store.
pub struct TrackingWorker {
    db: Arc<dyn Database>,
}

impl TrackingWorker {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobHandler for TrackingWorker {
    fn kind(&self) -> JobKind {
        JobKind::Tracking
    }

    async fn handle(&self, job: &crate::queue::Job) -> Result<JobOutcome, Error> {
        let payload: TrackingJob = job.parse_payload()?;
        let Some(log) = self.db.get_log(payload.log_id).await? else {
            return Ok(JobOutcome::Skipped("sending log no longer exists"));
        };

        let now = Utc::now();
        let lead_status = match payload.event {
            TrackEvent::Open => {
                self.db.mark_log_opened(log.id, now).await?;
                LeadStatus::Opened
            }
            TrackEvent::Click => {
                self.db.mark_log_clicked(log.id, now).await?;
                LeadStatus::Clicked
            }
        };
        self.db
            .update_lead_status_if_stronger(log.lead_id, lead_status)
            .await?;
        Ok(JobOutcome::Done)
    }
}

// ── Reply-fetch worker ──────────────────────────────────────────────

/// Scans every active mailbox inbox and routes each message through the
/// reconciler. One lease per mailbox; a contended lease means another node
/// is already scanning it, so this node skips rather than waits.
pub struct ReplyFetchWorker {
    db: Arc<dyn Database>,
    locks: LockManager,
    provider: Arc<dyn ProviderAdapter>,
    reconciler: Arc<Reconciler>,
}

impl ReplyFetchWorker {
    pub fn new(
        db: Arc<dyn Database>,
        locks: LockManager,
        provider: Arc<dyn ProviderAdapter>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            db,
            locks,
            provider,
            reconciler,
        }
    }

    async fn scan_mailbox(&self, mailbox: &Mailbox) -> Result<(), Error> {
        let fetched = self.provider.fetch_inbound(mailbox).await?;
        for inbound in &fetched {
            match self.reconciler.ingest_fetched(mailbox, inbound).await {
                Ok(_) => {}
                Err(Error::Reconcile(ReconcileError::Unresolvable)) => {
                    debug!(
                        mailbox = %mailbox.email,
                        from = %inbound.from_address,
                        "Inbound message matches no lead, ignoring"
                    );
                }
                Err(e) => {
                    warn!(
                        mailbox = %mailbox.email,
                        provider_message_id = %inbound.provider_message_id,
                        error = %e,
                        "Failed to reconcile inbound message"
                    );
                }
            }
        }
        self.db
            .update_mailbox_sync_watermark(mailbox.id, Utc::now())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ReplyFetchWorker {
    fn kind(&self) -> JobKind {
        JobKind::ReplyFetch
    }

    async fn handle(&self, _job: &crate::queue::Job) -> Result<JobOutcome, Error> {
        let mailboxes = self.db.list_active_mailboxes().await?;
        for mailbox in &mailboxes {
            let Some(lease) = self.locks.acquire(&mailbox_key(mailbox.id)).await else {
                debug!(mailbox = %mailbox.email, "Mailbox busy, skipping fetch");
                continue;
            };
            // IMAP scans can outlive the lease TTL; keep it fresh.
            self.locks.extend(&lease).await;
            if let Err(e) = self.scan_mailbox(mailbox).await {
                warn!(mailbox = %mailbox.email, error = %e, "Inbox scan failed");
            }
            self.locks.release(lease).await;
        }
        Ok(JobOutcome::Done)
    }
}

// ── Health check loop ───────────────────────────────────────────────

/// Periodically probes every active mailbox and raises an alert for the
/// unreachable ones. Returns the task handle and its shutdown flag.
pub fn spawn_health_check_loop(
    db: Arc<dyn Database>,
    provider: Arc<dyn ProviderAdapter>,
    alerts: AlertSender,
    period: Duration,
) -> (JoinHandle<()>, Arc<std::sync::atomic::AtomicBool>) {
    use std::sync::atomic::{AtomicBool, Ordering};

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if flag.load(Ordering::Relaxed) {
                break;
            }
            let mailboxes = match db.list_active_mailboxes().await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "Health check could not list mailboxes");
                    continue;
                }
            };
            for mailbox in &mailboxes {
                if let Err(e) = provider.health_check(mailbox).await {
                    // Out of rotation until an operator re-activates it.
                    if let Err(db_err) = db
                        .update_mailbox_status(mailbox.id, MailboxStatus::Disconnected)
                        .await
                    {
                        warn!(mailbox = %mailbox.email, error = %db_err, "Failed to mark mailbox disconnected");
                    }
                    alerts.send(
                        Alert::new(
                            AlertSeverity::Warning,
                            AlertKind::MailboxUnhealthy,
                            format!("Mailbox {} failed health probe: {e}", mailbox.email),
                        )
                        .workspace(mailbox.workspace_id)
                        .mailbox(mailbox.id),
                    );
                }
            }
        }
    });
    (handle, shutdown)
}
