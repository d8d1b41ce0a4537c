//! Backend-agnostic `Database` trait — single async interface for all
//! durable persistence: mailboxes, campaigns, leads, sending logs, jobs,
//! and inbound events.
//!
//! The core depends only on these read/update semantics, never on the
//! schema technology behind them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    Campaign, CampaignStatus, InboundEvent, Lead, LeadStatus, Mailbox, MailboxStatus,
    SendingLog, SequenceStep,
};
use crate::queue::{Job, JobKind, JobStatus};

#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError>;

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError>;

    /// All mailboxes in a workspace, any status.
    async fn list_mailboxes(&self, workspace_id: Uuid) -> Result<Vec<Mailbox>, DatabaseError>;

    /// Every `active` mailbox across workspaces (reply fetching, health checks).
    async fn list_active_mailboxes(&self) -> Result<Vec<Mailbox>, DatabaseError>;

    async fn update_mailbox_status(
        &self,
        id: Uuid,
        status: MailboxStatus,
    ) -> Result<(), DatabaseError>;

    /// Advance the reply-fetch watermark after a successful scan.
    async fn update_mailbox_sync_watermark(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Campaigns & steps ───────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError>;

    async fn update_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError>;

    async fn insert_step(&self, step: &SequenceStep) -> Result<(), DatabaseError>;

    /// Steps ordered by their position in the sequence.
    async fn list_steps(&self, campaign_id: Uuid) -> Result<Vec<SequenceStep>, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    async fn get_lead_by_email(
        &self,
        workspace_id: Uuid,
        email: &str,
    ) -> Result<Option<Lead>, DatabaseError>;

    /// Campaign leads that are neither terminal nor paused.
    async fn list_schedulable_leads(&self, campaign_id: Uuid) -> Result<Vec<Lead>, DatabaseError>;

    /// Apply a status transition only if it outranks the current status.
    /// Returns whether the row changed. This is the single write path for
    /// lead status, so a late `opened` can never overwrite `bounced`.
    async fn update_lead_status_if_stronger(
        &self,
        id: Uuid,
        status: LeadStatus,
    ) -> Result<bool, DatabaseError>;

    // ── Sending logs ────────────────────────────────────────────────

    async fn insert_log(&self, log: &SendingLog) -> Result<(), DatabaseError>;

    async fn get_log(&self, id: Uuid) -> Result<Option<SendingLog>, DatabaseError>;

    /// The most recent log for a lead within a campaign, any status.
    async fn latest_log_for_lead(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<SendingLog>, DatabaseError>;

    /// Logs created for a campaign at or after `since`, skipped ones
    /// excluded. Backs the campaign-level daily cap.
    async fn count_logs_since(
        &self,
        campaign_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    async fn mark_log_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn mark_log_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    async fn mark_log_skipped(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError>;

    async fn mark_log_opened(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn mark_log_clicked(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Atomically claim up to `limit` due jobs of one kind: flips them to
    /// `running` and bumps `attempts` in a single statement, returning the
    /// claimed rows. Two workers never claim the same job.
    async fn claim_due_jobs(
        &self,
        kind: JobKind,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError>;

    async fn complete_job(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Put a failed job back in the queue for a later attempt.
    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Route a job to the dead `failed` state. Kept for manual inspection,
    /// never auto-purged.
    async fn bury_job(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Re-queue a job without charging an attempt — used for quota denials,
    /// which are deliberate deferrals, not failures.
    async fn reschedule_job(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Crash recovery: flip `running` jobs back to `queued` on startup.
    /// Returns how many were reset.
    async fn reset_running_jobs(&self) -> Result<usize, DatabaseError>;

    async fn count_jobs(&self, kind: JobKind, status: JobStatus) -> Result<u64, DatabaseError>;

    // ── Inbound events ──────────────────────────────────────────────

    /// Persist an inbound event and apply the lead status update in one
    /// transaction. Returns `false` without side effects when an event with
    /// the same provider message id already exists in the workspace.
    async fn record_inbound(
        &self,
        event: &InboundEvent,
        lead_update: Option<(Uuid, LeadStatus)>,
    ) -> Result<bool, DatabaseError>;

    async fn get_inbound_by_provider_id(
        &self,
        workspace_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<InboundEvent>, DatabaseError>;
}
