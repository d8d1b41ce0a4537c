//! Domain entities: mailboxes, campaigns, leads, sending logs, inbound events.
//!
//! All entities are scoped by `workspace_id`. Status enums carry their DB
//! string form via `as_str()`/`parse_str()` so the storage layer and the
//! HTTP edge agree on spelling.

use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Mailbox ─────────────────────────────────────────────────────────

/// Sending/receiving identity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxStatus {
    Active,
    Paused,
    Disconnected,
}

impl MailboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxStatus::Active => "active",
            MailboxStatus::Paused => "paused",
            MailboxStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "paused" => MailboxStatus::Paused,
            "disconnected" => MailboxStatus::Disconnected,
            _ => MailboxStatus::Active,
        }
    }
}

/// SMTP/IMAP credentials for a mailbox. The password never appears in
/// `Debug` output; serialization exposes it only for the credentials
/// column in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxCredentials {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    #[serde(with = "secret_string")]
    pub password: SecretString,
}

/// Serde bridge for `SecretString`, which deliberately does not implement
/// `Serialize` on its own.
mod secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &SecretString, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
        String::deserialize(d).map(SecretString::from)
    }
}

/// A credentialed sending/receiving identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub email: String,
    pub status: MailboxStatus,
    /// Hard cap on sends per UTC day.
    pub daily_limit: u32,
    /// Token bucket capacity; refill rate is `hourly_limit` per hour.
    pub hourly_limit: u32,
    /// Jitter bounds between consecutive sends, in seconds.
    pub min_delay_secs: u32,
    pub max_delay_secs: u32,
    /// Whether this mailbox participates in warm-up rounds.
    pub warmup_enabled: bool,
    /// Watermark for reply fetching: only messages after this are scanned.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub credentials: MailboxCredentials,
}

impl Mailbox {
    pub fn is_active(&self) -> bool {
        self.status == MailboxStatus::Active
    }
}

// ── Campaign ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "active" => CampaignStatus::Active,
            "paused" => CampaignStatus::Paused,
            "completed" => CampaignStatus::Completed,
            _ => CampaignStatus::Draft,
        }
    }
}

/// Daily send window, interpreted in the campaign's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Campaign-level sending policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSettings {
    /// Cap on scheduled sends per UTC day across the campaign's mailboxes.
    pub daily_limit: u32,
    pub track_opens: bool,
    pub track_clicks: bool,
    /// Daily send window; `None` means send at any hour.
    pub send_window: Option<SendWindow>,
    /// IANA timezone name for the send window (e.g. "America/New_York").
    pub timezone: String,
    /// Skip Saturday/Sunday, deferring to Monday 09:00 UTC.
    pub work_days_only: bool,
    /// Auto-pause once bounce-or-spam rate reaches this percentage
    /// (checked only after more than 20 sends).
    pub auto_pause_bounce_pct: f64,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            daily_limit: 50,
            track_opens: true,
            track_clicks: true,
            send_window: None,
            timezone: "UTC".to_string(),
            work_days_only: false,
            auto_pause_bounce_pct: 5.0,
        }
    }
}

/// An outreach protocol: a linear ordered sequence of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub settings: CampaignSettings,
    /// Configured mailbox pool, in preference order.
    pub mailbox_ids: Vec<Uuid>,
}

/// One step of a campaign sequence.
///
/// `order` is contiguous and unique within a campaign (0-based).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub order: u32,
    pub subject: String,
    pub body: String,
    /// Full days to wait after the previous step was sent.
    pub delay_days: u32,
    /// Optional additional wait in minutes (for same-day follow-ups).
    pub wait_minutes: Option<u32>,
    /// Optional specific time of day to send at (campaign timezone).
    pub send_at: Option<NaiveTime>,
}

// ── Lead ────────────────────────────────────────────────────────────

/// Lead status lifecycle. Linear with terminal branches:
/// `unassigned → queued → sent → {opened, clicked} → replied | bounced |
/// unsubscribed | spam_complaint`, with `paused` reachable from any
/// active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Unassigned,
    Queued,
    Sent,
    Opened,
    Clicked,
    Replied,
    Bounced,
    Unsubscribed,
    SpamComplaint,
    Paused,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Unassigned => "unassigned",
            LeadStatus::Queued => "queued",
            LeadStatus::Sent => "sent",
            LeadStatus::Opened => "opened",
            LeadStatus::Clicked => "clicked",
            LeadStatus::Replied => "replied",
            LeadStatus::Bounced => "bounced",
            LeadStatus::Unsubscribed => "unsubscribed",
            LeadStatus::SpamComplaint => "spam_complaint",
            LeadStatus::Paused => "paused",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "queued" => LeadStatus::Queued,
            "sent" => LeadStatus::Sent,
            "opened" => LeadStatus::Opened,
            "clicked" => LeadStatus::Clicked,
            "replied" => LeadStatus::Replied,
            "bounced" => LeadStatus::Bounced,
            "unsubscribed" => LeadStatus::Unsubscribed,
            "spam_complaint" => LeadStatus::SpamComplaint,
            "paused" => LeadStatus::Paused,
            _ => LeadStatus::Unassigned,
        }
    }

    /// Monotonic ordering rank. A status update is applied only when the
    /// new rank is strictly greater than the current one, so a late
    /// `opened` event never overwrites `replied` or `bounced`.
    pub fn strength(&self) -> u8 {
        match self {
            LeadStatus::Unassigned => 0,
            LeadStatus::Queued => 1,
            LeadStatus::Sent => 2,
            LeadStatus::Opened => 3,
            LeadStatus::Clicked => 4,
            LeadStatus::Paused => 5,
            LeadStatus::Replied => 6,
            LeadStatus::Bounced => 7,
            LeadStatus::Unsubscribed => 8,
            LeadStatus::SpamComplaint => 9,
        }
    }

    /// Terminal states: no further steps are ever scheduled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LeadStatus::Replied
                | LeadStatus::Bounced
                | LeadStatus::Unsubscribed
                | LeadStatus::SpamComplaint
        )
    }

    /// States excluded from sequencer scans (terminal or paused).
    pub fn is_suppressed(&self) -> bool {
        self.is_terminal() || *self == LeadStatus::Paused
    }
}

/// A recipient. Belongs to at most one active campaign at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub email: String,
    pub status: LeadStatus,
    pub campaign_id: Option<Uuid>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    /// Template variables: `{{first_name}}` etc. resolve from here.
    pub custom_fields: HashMap<String, String>,
}

// ── Sending log ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Queued,
    Sent,
    Failed,
    Skipped,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Queued => "queued",
            LogStatus::Sent => "sent",
            LogStatus::Failed => "failed",
            LogStatus::Skipped => "skipped",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "sent" => LogStatus::Sent,
            "failed" => LogStatus::Failed,
            "skipped" => LogStatus::Skipped,
            _ => LogStatus::Queued,
        }
    }
}

/// Audit record of one scheduled send. The log id doubles as the job
/// correlation token embedded in the outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingLog {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub mailbox_id: Uuid,
    pub step_id: Uuid,
    pub status: LogStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
}

impl SendingLog {
    pub fn new(
        workspace_id: Uuid,
        campaign_id: Uuid,
        lead_id: Uuid,
        mailbox_id: Uuid,
        step_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            campaign_id,
            lead_id,
            mailbox_id,
            step_id,
            status: LogStatus::Queued,
            provider_message_id: None,
            error: None,
            created_at: Utc::now(),
            sent_at: None,
            opened_at: None,
            clicked_at: None,
        }
    }
}

// ── Inbound events ──────────────────────────────────────────────────

/// Normalized inbound event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundType {
    Reply,
    HardBounce,
    SoftBounce,
    SpamComplaint,
}

impl InboundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundType::Reply => "reply",
            InboundType::HardBounce => "hard_bounce",
            InboundType::SoftBounce => "soft_bounce",
            InboundType::SpamComplaint => "spam_complaint",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "hard_bounce" => InboundType::HardBounce,
            "soft_bounce" => InboundType::SoftBounce,
            "spam_complaint" => InboundType::SpamComplaint,
            _ => InboundType::Reply,
        }
    }
}

/// A stored inbound event, keyed by the provider-assigned message id for
/// idempotency (unique per workspace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub provider_message_id: String,
    pub event_type: InboundType,
    pub mailbox_id: Option<Uuid>,
    pub log_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub from_address: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub raw_reason: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Category returned by the external reply classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyCategory {
    Interested,
    NotInterested,
    Unsubscribe,
    Neutral,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            LeadStatus::Unassigned,
            LeadStatus::Queued,
            LeadStatus::Sent,
            LeadStatus::Opened,
            LeadStatus::Clicked,
            LeadStatus::Replied,
            LeadStatus::Bounced,
            LeadStatus::Unsubscribed,
            LeadStatus::SpamComplaint,
            LeadStatus::Paused,
        ] {
            assert_eq!(LeadStatus::parse_str(s.as_str()), s);
        }
    }

    #[test]
    fn terminal_states_are_suppressed() {
        assert!(LeadStatus::Replied.is_suppressed());
        assert!(LeadStatus::Bounced.is_suppressed());
        assert!(LeadStatus::Unsubscribed.is_suppressed());
        assert!(LeadStatus::SpamComplaint.is_suppressed());
        assert!(LeadStatus::Paused.is_suppressed());
        assert!(!LeadStatus::Sent.is_suppressed());
        assert!(!LeadStatus::Opened.is_suppressed());
    }

    #[test]
    fn strength_is_monotonic_along_lifecycle() {
        let order = [
            LeadStatus::Unassigned,
            LeadStatus::Queued,
            LeadStatus::Sent,
            LeadStatus::Opened,
            LeadStatus::Clicked,
            LeadStatus::Replied,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].strength() < pair[1].strength());
        }
        // Opened must never outrank a terminal status.
        assert!(LeadStatus::Opened.strength() < LeadStatus::Bounced.strength());
        assert!(LeadStatus::Clicked.strength() < LeadStatus::Replied.strength());
    }

    #[test]
    fn credentials_password_is_redacted_in_debug() {
        let creds = MailboxCredentials {
            smtp_host: "smtp.test.com".into(),
            smtp_port: 587,
            imap_host: "imap.test.com".into(),
            imap_port: 993,
            username: "user".into(),
            password: SecretString::from("hunter2"),
        };
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("hunter2"));
    }
}
