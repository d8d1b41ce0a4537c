//! libSQL backend — async `Database` trait implementation.
//!
//! A single connection is reused for all operations. `libsql::Connection`
//! is `Send + Sync` and safe for concurrent async use. Supports local file
//! and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    Campaign, CampaignSettings, CampaignStatus, InboundEvent, InboundType, Lead, LeadStatus,
    Mailbox, MailboxStatus, SendingLog, SequenceStep,
};
use crate::queue::{Job, JobKind, JobStatus};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_optional_uuid(s: &Option<String>) -> Option<Uuid> {
    s.as_ref().map(|s| parse_uuid(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    opt_text_owned(id.map(|u| u.to_string()))
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(|d| d.to_rfc3339()))
}

/// SQL predicate matching only statuses strictly weaker than `status`.
/// All status strings are static, so inlining them is injection-safe.
fn weaker_statuses_predicate(status: LeadStatus) -> String {
    const ALL: &[LeadStatus] = &[
        LeadStatus::Unassigned,
        LeadStatus::Queued,
        LeadStatus::Sent,
        LeadStatus::Opened,
        LeadStatus::Clicked,
        LeadStatus::Paused,
        LeadStatus::Replied,
        LeadStatus::Bounced,
        LeadStatus::Unsubscribed,
        LeadStatus::SpamComplaint,
    ];
    let weaker: Vec<String> = ALL
        .iter()
        .filter(|s| s.strength() < status.strength())
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    if weaker.is_empty() {
        // Nothing is weaker than the floor status; match no rows.
        "1 = 0".to_string()
    } else {
        format!("status IN ({})", weaker.join(", "))
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const MAILBOX_COLUMNS: &str = "id, workspace_id, email, status, daily_limit, hourly_limit, \
     min_delay_secs, max_delay_secs, warmup_enabled, last_sync_at, credentials";

fn row_to_mailbox(row: &libsql::Row) -> Result<Mailbox, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let workspace_id: String = row.get(1).map_err(row_err)?;
    let status: String = row.get(3).map_err(row_err)?;
    let last_sync_at: Option<String> = row.get(9).ok();
    let credentials: String = row.get(10).map_err(row_err)?;
    let credentials = serde_json::from_str(&credentials)
        .map_err(|e| DatabaseError::Serialization(format!("mailbox credentials: {e}")))?;

    Ok(Mailbox {
        id: parse_uuid(&id),
        workspace_id: parse_uuid(&workspace_id),
        email: row.get(2).map_err(row_err)?,
        status: MailboxStatus::parse_str(&status),
        daily_limit: row.get::<i64>(4).map_err(row_err)? as u32,
        hourly_limit: row.get::<i64>(5).map_err(row_err)? as u32,
        min_delay_secs: row.get::<i64>(6).map_err(row_err)? as u32,
        max_delay_secs: row.get::<i64>(7).map_err(row_err)? as u32,
        warmup_enabled: row.get::<i64>(8).map_err(row_err)? != 0,
        last_sync_at: parse_optional_datetime(&last_sync_at),
        credentials,
    })
}

const CAMPAIGN_COLUMNS: &str = "id, workspace_id, name, status, settings, mailbox_ids";

fn row_to_campaign(row: &libsql::Row) -> Result<Campaign, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let workspace_id: String = row.get(1).map_err(row_err)?;
    let status: String = row.get(3).map_err(row_err)?;
    let settings: String = row.get(4).map_err(row_err)?;
    let settings: CampaignSettings = serde_json::from_str(&settings)
        .map_err(|e| DatabaseError::Serialization(format!("campaign settings: {e}")))?;
    let mailbox_ids: String = row.get(5).map_err(row_err)?;
    let mailbox_ids: Vec<Uuid> = serde_json::from_str(&mailbox_ids)
        .map_err(|e| DatabaseError::Serialization(format!("campaign mailbox_ids: {e}")))?;

    Ok(Campaign {
        id: parse_uuid(&id),
        workspace_id: parse_uuid(&workspace_id),
        name: row.get(2).map_err(row_err)?,
        status: CampaignStatus::parse_str(&status),
        settings,
        mailbox_ids,
    })
}

const STEP_COLUMNS: &str =
    "id, campaign_id, step_order, subject, body, delay_days, wait_minutes, send_at";

fn row_to_step(row: &libsql::Row) -> Result<SequenceStep, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let campaign_id: String = row.get(1).map_err(row_err)?;
    let wait_minutes: Option<i64> = row.get(6).ok();
    let send_at: Option<String> = row.get(7).ok();

    Ok(SequenceStep {
        id: parse_uuid(&id),
        campaign_id: parse_uuid(&campaign_id),
        order: row.get::<i64>(2).map_err(row_err)? as u32,
        subject: row.get(3).map_err(row_err)?,
        body: row.get(4).map_err(row_err)?,
        delay_days: row.get::<i64>(5).map_err(row_err)? as u32,
        wait_minutes: wait_minutes.map(|m| m as u32),
        send_at: send_at.and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M:%S").ok()),
    })
}

const LEAD_COLUMNS: &str =
    "id, workspace_id, email, status, campaign_id, last_event_at, tags, custom_fields";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let workspace_id: String = row.get(1).map_err(row_err)?;
    let status: String = row.get(3).map_err(row_err)?;
    let campaign_id: Option<String> = row.get(4).ok();
    let last_event_at: Option<String> = row.get(5).ok();
    let tags: String = row.get(6).map_err(row_err)?;
    let custom_fields: String = row.get(7).map_err(row_err)?;

    Ok(Lead {
        id: parse_uuid(&id),
        workspace_id: parse_uuid(&workspace_id),
        email: row.get(2).map_err(row_err)?,
        status: LeadStatus::parse_str(&status),
        campaign_id: parse_optional_uuid(&campaign_id),
        last_event_at: parse_optional_datetime(&last_event_at),
        tags: serde_json::from_str(&tags)
            .map_err(|e| DatabaseError::Serialization(format!("lead tags: {e}")))?,
        custom_fields: serde_json::from_str(&custom_fields)
            .map_err(|e| DatabaseError::Serialization(format!("lead custom_fields: {e}")))?,
    })
}

const LOG_COLUMNS: &str = "id, workspace_id, campaign_id, lead_id, mailbox_id, step_id, status, \
     provider_message_id, error, created_at, sent_at, opened_at, clicked_at";

fn row_to_log(row: &libsql::Row) -> Result<SendingLog, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let workspace_id: String = row.get(1).map_err(row_err)?;
    let campaign_id: String = row.get(2).map_err(row_err)?;
    let lead_id: String = row.get(3).map_err(row_err)?;
    let mailbox_id: String = row.get(4).map_err(row_err)?;
    let step_id: String = row.get(5).map_err(row_err)?;
    let status: String = row.get(6).map_err(row_err)?;
    let created_at: String = row.get(9).map_err(row_err)?;
    let sent_at: Option<String> = row.get(10).ok();
    let opened_at: Option<String> = row.get(11).ok();
    let clicked_at: Option<String> = row.get(12).ok();

    Ok(SendingLog {
        id: parse_uuid(&id),
        workspace_id: parse_uuid(&workspace_id),
        campaign_id: parse_uuid(&campaign_id),
        lead_id: parse_uuid(&lead_id),
        mailbox_id: parse_uuid(&mailbox_id),
        step_id: parse_uuid(&step_id),
        status: crate::model::LogStatus::parse_str(&status),
        provider_message_id: row.get(7).ok(),
        error: row.get(8).ok(),
        created_at: parse_datetime(&created_at),
        sent_at: parse_optional_datetime(&sent_at),
        opened_at: parse_optional_datetime(&opened_at),
        clicked_at: parse_optional_datetime(&clicked_at),
    })
}

const JOB_COLUMNS: &str =
    "id, kind, payload, status, attempts, max_attempts, run_at, last_error, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let kind: String = row.get(1).map_err(row_err)?;
    let payload: String = row.get(2).map_err(row_err)?;
    let status: String = row.get(3).map_err(row_err)?;
    let run_at: String = row.get(6).map_err(row_err)?;
    let created_at: String = row.get(8).map_err(row_err)?;
    let updated_at: String = row.get(9).map_err(row_err)?;

    Ok(Job {
        id: parse_uuid(&id),
        kind: JobKind::parse_str(&kind),
        payload: serde_json::from_str(&payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?,
        status: JobStatus::parse_str(&status),
        attempts: row.get::<i64>(4).map_err(row_err)? as u32,
        max_attempts: row.get::<i64>(5).map_err(row_err)? as u32,
        run_at: parse_datetime(&run_at),
        last_error: row.get(7).ok(),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const INBOUND_COLUMNS: &str = "id, workspace_id, provider_message_id, event_type, mailbox_id, \
     log_id, lead_id, from_address, subject, body, raw_reason, received_at";

fn row_to_inbound(row: &libsql::Row) -> Result<InboundEvent, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let workspace_id: String = row.get(1).map_err(row_err)?;
    let event_type: String = row.get(3).map_err(row_err)?;
    let mailbox_id: Option<String> = row.get(4).ok();
    let log_id: Option<String> = row.get(5).ok();
    let lead_id: Option<String> = row.get(6).ok();
    let received_at: String = row.get(11).map_err(row_err)?;

    Ok(InboundEvent {
        id: parse_uuid(&id),
        workspace_id: parse_uuid(&workspace_id),
        provider_message_id: row.get(2).map_err(row_err)?,
        event_type: InboundType::parse_str(&event_type),
        mailbox_id: parse_optional_uuid(&mailbox_id),
        log_id: parse_optional_uuid(&log_id),
        lead_id: parse_optional_uuid(&lead_id),
        from_address: row.get(7).map_err(row_err)?,
        subject: row.get(8).ok(),
        body: row.get(9).ok(),
        raw_reason: row.get(10).ok(),
        received_at: parse_datetime(&received_at),
    })
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

fn query_err(op: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("{op}: {e}"))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError> {
        let credentials = serde_json::to_string(&mailbox.credentials)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO mailboxes (id, workspace_id, email, status, daily_limit, hourly_limit, \
                 min_delay_secs, max_delay_secs, warmup_enabled, last_sync_at, credentials) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    mailbox.id.to_string(),
                    mailbox.workspace_id.to_string(),
                    mailbox.email.clone(),
                    mailbox.status.as_str(),
                    mailbox.daily_limit as i64,
                    mailbox.hourly_limit as i64,
                    mailbox.min_delay_secs as i64,
                    mailbox.max_delay_secs as i64,
                    mailbox.warmup_enabled as i64,
                    opt_datetime(mailbox.last_sync_at),
                    credentials,
                ],
            )
            .await
            .map_err(|e| query_err("insert_mailbox", e))?;

        debug!(mailbox_id = %mailbox.id, email = %mailbox.email, "Mailbox inserted");
        Ok(())
    }

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("get_mailbox", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_mailbox(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("get_mailbox", e)),
        }
    }

    async fn list_mailboxes(&self, workspace_id: Uuid) -> Result<Vec<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE workspace_id = ?1 ORDER BY email"
                ),
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| query_err("list_mailboxes", e))?;

        let mut mailboxes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_mailbox(&row) {
                Ok(m) => mailboxes.push(m),
                Err(e) => tracing::warn!("Skipping mailbox row: {e}"),
            }
        }
        Ok(mailboxes)
    }

    async fn list_active_mailboxes(&self) -> Result<Vec<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE status = 'active' ORDER BY email"
                ),
                (),
            )
            .await
            .map_err(|e| query_err("list_active_mailboxes", e))?;

        let mut mailboxes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_mailbox(&row) {
                Ok(m) => mailboxes.push(m),
                Err(e) => tracing::warn!("Skipping mailbox row: {e}"),
            }
        }
        Ok(mailboxes)
    }

    async fn update_mailbox_status(
        &self,
        id: Uuid,
        status: MailboxStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("update_mailbox_status", e))?;

        debug!(mailbox_id = %id, status = status.as_str(), "Mailbox status updated");
        Ok(())
    }

    async fn update_mailbox_sync_watermark(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET last_sync_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![at.to_rfc3339(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("update_mailbox_sync_watermark", e))?;
        Ok(())
    }

    // ── Campaigns & steps ───────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        let settings = serde_json::to_string(&campaign.settings)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let mailbox_ids = serde_json::to_string(&campaign.mailbox_ids)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO campaigns (id, workspace_id, name, status, settings, mailbox_ids) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    campaign.id.to_string(),
                    campaign.workspace_id.to_string(),
                    campaign.name.clone(),
                    campaign.status.as_str(),
                    settings,
                    mailbox_ids,
                ],
            )
            .await
            .map_err(|e| query_err("insert_campaign", e))?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("get_campaign", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_campaign(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("get_campaign", e)),
        }
    }

    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = 'active' ORDER BY name"
                ),
                (),
            )
            .await
            .map_err(|e| query_err("list_active_campaigns", e))?;

        let mut campaigns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_campaign(&row) {
                Ok(c) => campaigns.push(c),
                Err(e) => tracing::warn!("Skipping campaign row: {e}"),
            }
        }
        Ok(campaigns)
    }

    async fn update_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("update_campaign_status", e))?;

        debug!(campaign_id = %id, status = status.as_str(), "Campaign status updated");
        Ok(())
    }

    async fn insert_step(&self, step: &SequenceStep) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sequence_steps (id, campaign_id, step_order, subject, body, \
                 delay_days, wait_minutes, send_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    step.id.to_string(),
                    step.campaign_id.to_string(),
                    step.order as i64,
                    step.subject.clone(),
                    step.body.clone(),
                    step.delay_days as i64,
                    match step.wait_minutes {
                        Some(m) => libsql::Value::Integer(m as i64),
                        None => libsql::Value::Null,
                    },
                    opt_text_owned(step.send_at.map(|t| t.format("%H:%M:%S").to_string())),
                ],
            )
            .await
            .map_err(|e| query_err("insert_step", e))?;
        Ok(())
    }

    async fn list_steps(&self, campaign_id: Uuid) -> Result<Vec<SequenceStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM sequence_steps WHERE campaign_id = ?1 \
                     ORDER BY step_order ASC"
                ),
                params![campaign_id.to_string()],
            )
            .await
            .map_err(|e| query_err("list_steps", e))?;

        let mut steps = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_step(&row) {
                Ok(s) => steps.push(s),
                Err(e) => tracing::warn!("Skipping step row: {e}"),
            }
        }
        Ok(steps)
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let tags = serde_json::to_string(&lead.tags)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let custom_fields = serde_json::to_string(&lead.custom_fields)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO leads (id, workspace_id, email, status, campaign_id, last_event_at, \
                 tags, custom_fields) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    lead.id.to_string(),
                    lead.workspace_id.to_string(),
                    lead.email.clone(),
                    lead.status.as_str(),
                    opt_uuid(lead.campaign_id),
                    opt_datetime(lead.last_event_at),
                    tags,
                    custom_fields,
                ],
            )
            .await
            .map_err(|e| query_err("insert_lead", e))?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("get_lead", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("get_lead", e)),
        }
    }

    async fn get_lead_by_email(
        &self,
        workspace_id: Uuid,
        email: &str,
    ) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE workspace_id = ?1 AND email = ?2"
                ),
                params![workspace_id.to_string(), email],
            )
            .await
            .map_err(|e| query_err("get_lead_by_email", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("get_lead_by_email", e)),
        }
    }

    async fn list_schedulable_leads(&self, campaign_id: Uuid) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE campaign_id = ?1 AND status NOT IN \
                     ('replied', 'bounced', 'unsubscribed', 'spam_complaint', 'paused') \
                     ORDER BY email"
                ),
                params![campaign_id.to_string()],
            )
            .await
            .map_err(|e| query_err("list_schedulable_leads", e))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(l) => leads.push(l),
                Err(e) => tracing::warn!("Skipping lead row: {e}"),
            }
        }
        Ok(leads)
    }

    async fn update_lead_status_if_stronger(
        &self,
        id: Uuid,
        status: LeadStatus,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE leads SET status = ?1, last_event_at = ?2, updated_at = ?2 \
                     WHERE id = ?3 AND {}",
                    weaker_statuses_predicate(status)
                ),
                params![status.as_str(), now, id.to_string()],
            )
            .await
            .map_err(|e| query_err("update_lead_status_if_stronger", e))?;

        if count > 0 {
            debug!(lead_id = %id, status = status.as_str(), "Lead status advanced");
        }
        Ok(count > 0)
    }

    // ── Sending logs ────────────────────────────────────────────────

    async fn insert_log(&self, log: &SendingLog) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sending_logs (id, workspace_id, campaign_id, lead_id, mailbox_id, \
                 step_id, status, provider_message_id, error, created_at, sent_at, opened_at, \
                 clicked_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    log.id.to_string(),
                    log.workspace_id.to_string(),
                    log.campaign_id.to_string(),
                    log.lead_id.to_string(),
                    log.mailbox_id.to_string(),
                    log.step_id.to_string(),
                    log.status.as_str(),
                    opt_text_owned(log.provider_message_id.clone()),
                    opt_text_owned(log.error.clone()),
                    log.created_at.to_rfc3339(),
                    opt_datetime(log.sent_at),
                    opt_datetime(log.opened_at),
                    opt_datetime(log.clicked_at),
                ],
            )
            .await
            .map_err(|e| query_err("insert_log", e))?;
        Ok(())
    }

    async fn get_log(&self, id: Uuid) -> Result<Option<SendingLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM sending_logs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("get_log", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_log(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("get_log", e)),
        }
    }

    async fn latest_log_for_lead(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<SendingLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM sending_logs \
                     WHERE campaign_id = ?1 AND lead_id = ?2 \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![campaign_id.to_string(), lead_id.to_string()],
            )
            .await
            .map_err(|e| query_err("latest_log_for_lead", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_log(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("latest_log_for_lead", e)),
        }
    }

    async fn count_logs_since(
        &self,
        campaign_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM sending_logs \
                 WHERE campaign_id = ?1 AND created_at >= ?2 AND status != 'skipped'",
                params![campaign_id.to_string(), since.to_rfc3339()],
            )
            .await
            .map_err(|e| query_err("count_logs_since", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            _ => Ok(0),
        }
    }

    async fn mark_log_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sending_logs SET status = 'sent', provider_message_id = ?1, sent_at = ?2 \
                 WHERE id = ?3",
                params![provider_message_id, at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("mark_log_sent", e))?;
        Ok(())
    }

    async fn mark_log_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sending_logs SET status = 'failed', error = ?1 WHERE id = ?2",
                params![error, id.to_string()],
            )
            .await
            .map_err(|e| query_err("mark_log_failed", e))?;
        Ok(())
    }

    async fn mark_log_skipped(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sending_logs SET status = 'skipped', error = ?1 WHERE id = ?2",
                params![reason, id.to_string()],
            )
            .await
            .map_err(|e| query_err("mark_log_skipped", e))?;
        Ok(())
    }

    async fn mark_log_opened(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        // First touch wins; repeated opens keep the original timestamp.
        self.conn()
            .execute(
                "UPDATE sending_logs SET opened_at = COALESCE(opened_at, ?1) WHERE id = ?2",
                params![at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("mark_log_opened", e))?;
        Ok(())
    }

    async fn mark_log_clicked(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sending_logs SET clicked_at = COALESCE(clicked_at, ?1), \
                 opened_at = COALESCE(opened_at, ?1) WHERE id = ?2",
                params![at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("mark_log_clicked", e))?;
        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO jobs (id, kind, payload, status, attempts, max_attempts, run_at, \
                 last_error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job.id.to_string(),
                    job.kind.as_str(),
                    payload,
                    job.status.as_str(),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    job.run_at.to_rfc3339(),
                    opt_text_owned(job.last_error.clone()),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| query_err("insert_job", e))?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("get_job", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("get_job", e)),
        }
    }

    async fn claim_due_jobs(
        &self,
        kind: JobKind,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError> {
        // Single statement: claim and return in one step so two workers can
        // never pick up the same row.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = ?1 \
                     WHERE id IN (\
                         SELECT id FROM jobs \
                         WHERE kind = ?2 AND status = 'queued' AND run_at <= ?3 \
                         ORDER BY run_at ASC LIMIT ?4\
                     ) RETURNING {JOB_COLUMNS}"
                ),
                params![
                    now.to_rfc3339(),
                    kind.as_str(),
                    now.to_rfc3339(),
                    limit as i64
                ],
            )
            .await
            .map_err(|e| query_err("claim_due_jobs", e))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(j) => jobs.push(j),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn complete_job(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET status = 'done', updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("complete_job", e))?;
        Ok(())
    }

    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET status = 'queued', last_error = ?1, run_at = ?2, updated_at = ?3 \
                 WHERE id = ?4",
                params![
                    error,
                    run_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| query_err("retry_job", e))?;
        Ok(())
    }

    async fn bury_job(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("bury_job", e))?;
        Ok(())
    }

    async fn reschedule_job(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        // Refund the attempt that the claim charged.
        self.conn()
            .execute(
                "UPDATE jobs SET status = 'queued', attempts = MAX(attempts - 1, 0), \
                 run_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![run_at.to_rfc3339(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| query_err("reschedule_job", e))?;
        Ok(())
    }

    async fn reset_running_jobs(&self) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'queued', updated_at = ?1 WHERE status = 'running'",
                params![Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| query_err("reset_running_jobs", e))?;

        if count > 0 {
            info!(count, "Reset in-flight jobs from previous run");
        }
        Ok(count as usize)
    }

    async fn count_jobs(&self, kind: JobKind, status: JobStatus) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs WHERE kind = ?1 AND status = ?2",
                params![kind.as_str(), status.as_str()],
            )
            .await
            .map_err(|e| query_err("count_jobs", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            _ => Ok(0),
        }
    }

    // ── Inbound events ──────────────────────────────────────────────

    async fn record_inbound(
        &self,
        event: &InboundEvent,
        lead_update: Option<(Uuid, LeadStatus)>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| query_err("record_inbound begin", e))?;

        let result = async {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO inbound_events (id, workspace_id, \
                     provider_message_id, event_type, mailbox_id, log_id, lead_id, from_address, \
                     subject, body, raw_reason, received_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        event.id.to_string(),
                        event.workspace_id.to_string(),
                        event.provider_message_id.clone(),
                        event.event_type.as_str(),
                        opt_uuid(event.mailbox_id),
                        opt_uuid(event.log_id),
                        opt_uuid(event.lead_id),
                        event.from_address.clone(),
                        opt_text_owned(event.subject.clone()),
                        opt_text_owned(event.body.clone()),
                        opt_text_owned(event.raw_reason.clone()),
                        event.received_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| query_err("record_inbound insert", e))?;

            if inserted == 0 {
                // Duplicate provider message id: no side effects.
                return Ok(false);
            }

            if let Some((lead_id, status)) = lead_update {
                conn.execute(
                    &format!(
                        "UPDATE leads SET status = ?1, last_event_at = ?2, updated_at = ?2 \
                         WHERE id = ?3 AND {}",
                        weaker_statuses_predicate(status)
                    ),
                    params![
                        status.as_str(),
                        Utc::now().to_rfc3339(),
                        lead_id.to_string()
                    ],
                )
                .await
                .map_err(|e| query_err("record_inbound lead update", e))?;
            }

            Ok(true)
        }
        .await;

        match &result {
            Ok(_) => {
                conn.execute("COMMIT", ())
                    .await
                    .map_err(|e| query_err("record_inbound commit", e))?;
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", ()).await;
            }
        }
        result
    }

    async fn get_inbound_by_provider_id(
        &self,
        workspace_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<InboundEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INBOUND_COLUMNS} FROM inbound_events \
                     WHERE workspace_id = ?1 AND provider_message_id = ?2"
                ),
                params![workspace_id.to_string(), provider_message_id],
            )
            .await
            .map_err(|e| query_err("get_inbound_by_provider_id", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_inbound(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err("get_inbound_by_provider_id", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MailboxCredentials;
    use secrecy::{ExposeSecret, SecretString};
    use std::collections::HashMap;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn mailbox(workspace_id: Uuid) -> Mailbox {
        Mailbox {
            id: Uuid::new_v4(),
            workspace_id,
            email: "sender@example.com".into(),
            status: MailboxStatus::Active,
            daily_limit: 40,
            hourly_limit: 10,
            min_delay_secs: 30,
            max_delay_secs: 120,
            warmup_enabled: true,
            last_sync_at: None,
            credentials: MailboxCredentials {
                smtp_host: "smtp.example.com".into(),
                smtp_port: 587,
                imap_host: "imap.example.com".into(),
                imap_port: 993,
                username: "sender@example.com".into(),
                password: SecretString::from("hunter2"),
            },
        }
    }

    fn lead(workspace_id: Uuid, campaign_id: Uuid) -> Lead {
        Lead {
            id: Uuid::new_v4(),
            workspace_id,
            email: "lead@example.com".into(),
            status: LeadStatus::Unassigned,
            campaign_id: Some(campaign_id),
            last_event_at: None,
            tags: vec!["cold".into()],
            custom_fields: HashMap::from([("first_name".into(), "Ada".into())]),
        }
    }

    #[tokio::test]
    async fn data_survives_reopening_an_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outflow.db");

        let ws = Uuid::new_v4();
        let m = mailbox(ws);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_mailbox(&m).await.unwrap();
        }

        // Reopen: migrations are idempotent, data is still there.
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let got = db.get_mailbox(m.id).await.unwrap().unwrap();
        assert_eq!(got.email, m.email);
        assert_eq!(got.credentials.password.expose_secret(), "hunter2");
    }

    #[tokio::test]
    async fn mailbox_roundtrip_preserves_credentials() {
        let db = backend().await;
        let ws = Uuid::new_v4();
        let m = mailbox(ws);
        db.insert_mailbox(&m).await.unwrap();

        let got = db.get_mailbox(m.id).await.unwrap().unwrap();
        assert_eq!(got.email, m.email);
        assert_eq!(got.daily_limit, 40);
        assert!(got.warmup_enabled);
        assert_eq!(got.credentials.smtp_host, "smtp.example.com");
        assert_eq!(got.credentials.password.expose_secret(), "hunter2");
    }

    #[tokio::test]
    async fn steps_come_back_in_sequence_order() {
        let db = backend().await;
        let campaign = Campaign {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "Launch".into(),
            status: CampaignStatus::Active,
            settings: CampaignSettings::default(),
            mailbox_ids: vec![Uuid::new_v4()],
        };
        db.insert_campaign(&campaign).await.unwrap();

        for order in [2u32, 0, 1] {
            db.insert_step(&SequenceStep {
                id: Uuid::new_v4(),
                campaign_id: campaign.id,
                order,
                subject: format!("Step {order}"),
                body: "Hi {{first_name}}".into(),
                delay_days: order,
                wait_minutes: None,
                send_at: None,
            })
            .await
            .unwrap();
        }

        let steps = db.list_steps(campaign.id).await.unwrap();
        assert_eq!(
            steps.iter().map(|s| s.order).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let got = db.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(got.mailbox_ids, campaign.mailbox_ids);
        assert_eq!(got.settings.daily_limit, 50);
    }

    #[tokio::test]
    async fn lead_status_never_downgrades() {
        let db = backend().await;
        let ws = Uuid::new_v4();
        let l = lead(ws, Uuid::new_v4());
        db.insert_lead(&l).await.unwrap();

        assert!(
            db.update_lead_status_if_stronger(l.id, LeadStatus::Sent)
                .await
                .unwrap()
        );
        assert!(
            db.update_lead_status_if_stronger(l.id, LeadStatus::Replied)
                .await
                .unwrap()
        );
        // A late open must not overwrite the reply.
        assert!(
            !db.update_lead_status_if_stronger(l.id, LeadStatus::Opened)
                .await
                .unwrap()
        );

        let got = db.get_lead(l.id).await.unwrap().unwrap();
        assert_eq!(got.status, LeadStatus::Replied);
    }

    #[tokio::test]
    async fn schedulable_leads_exclude_suppressed() {
        let db = backend().await;
        let ws = Uuid::new_v4();
        let campaign_id = Uuid::new_v4();

        let active = lead(ws, campaign_id);
        db.insert_lead(&active).await.unwrap();

        let mut done = lead(ws, campaign_id);
        done.id = Uuid::new_v4();
        done.email = "replied@example.com".into();
        done.status = LeadStatus::Replied;
        db.insert_lead(&done).await.unwrap();

        let leads = db.list_schedulable_leads(campaign_id).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].id, active.id);
    }

    #[tokio::test]
    async fn log_lifecycle() {
        let db = backend().await;
        let log = SendingLog::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        db.insert_log(&log).await.unwrap();

        let sent_at = Utc::now();
        db.mark_log_sent(log.id, "<abc@mail>", sent_at).await.unwrap();

        let open1 = Utc::now();
        db.mark_log_opened(log.id, open1).await.unwrap();
        db.mark_log_opened(log.id, open1 + chrono::Duration::hours(1))
            .await
            .unwrap();

        let got = db.get_log(log.id).await.unwrap().unwrap();
        assert_eq!(got.status, crate::model::LogStatus::Sent);
        assert_eq!(got.provider_message_id.as_deref(), Some("<abc@mail>"));
        // Repeated opens keep the first timestamp.
        assert_eq!(got.opened_at.unwrap().timestamp(), open1.timestamp());

        let latest = db
            .latest_log_for_lead(log.campaign_id, log.lead_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, log.id);
    }

    #[tokio::test]
    async fn claim_orders_by_run_at_and_respects_limit() {
        let db = backend().await;
        let now = Utc::now();
        for offset in [3i64, 1, 2] {
            let job = Job::new(
                JobKind::Send,
                serde_json::json!({"log_id": Uuid::new_v4()}),
                now - chrono::Duration::minutes(offset),
                3,
            );
            db.insert_job(&job).await.unwrap();
        }

        let first = db.claim_due_jobs(JobKind::Send, 2, now).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].run_at <= first[1].run_at);

        let rest = db.claim_due_jobs(JobKind::Send, 2, now).await.unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn reset_running_jobs_requeues_in_flight_work() {
        let db = backend().await;
        let job = Job::new(
            JobKind::ReplyFetch,
            serde_json::json!({}),
            Utc::now(),
            3,
        );
        db.insert_job(&job).await.unwrap();
        db.claim_due_jobs(JobKind::ReplyFetch, 1, Utc::now())
            .await
            .unwrap();

        assert_eq!(db.reset_running_jobs().await.unwrap(), 1);
        let got = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn duplicate_inbound_is_ignored_with_no_side_effects() {
        let db = backend().await;
        let ws = Uuid::new_v4();
        let l = lead(ws, Uuid::new_v4());
        db.insert_lead(&l).await.unwrap();

        let event = InboundEvent {
            id: Uuid::new_v4(),
            workspace_id: ws,
            provider_message_id: "<reply-1@remote>".into(),
            event_type: InboundType::Reply,
            mailbox_id: None,
            log_id: None,
            lead_id: Some(l.id),
            from_address: l.email.clone(),
            subject: Some("Re: hello".into()),
            body: Some("interested!".into()),
            raw_reason: None,
            received_at: Utc::now(),
        };

        assert!(
            db.record_inbound(&event, Some((l.id, LeadStatus::Replied)))
                .await
                .unwrap()
        );

        // Same provider id again, this time trying to push a stronger status.
        let mut dup = event.clone();
        dup.id = Uuid::new_v4();
        assert!(
            !db.record_inbound(&dup, Some((l.id, LeadStatus::Bounced)))
                .await
                .unwrap()
        );

        let got = db.get_lead(l.id).await.unwrap().unwrap();
        assert_eq!(got.status, LeadStatus::Replied);

        let stored = db
            .get_inbound_by_provider_id(ws, "<reply-1@remote>")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, event.id);
    }
}
