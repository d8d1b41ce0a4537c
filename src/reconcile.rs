//! Inbound reconciliation: replies, bounces, and spam complaints flow back
//! into lead state, mailbox state, and campaign reputation.
//!
//! Ingestion is idempotent on the provider message id — the event insert and
//! the lead status change commit together, so replaying a webhook or
//! re-fetching a message changes nothing. Lead status moves only forward
//! along the strength ordering; the store enforces that, not the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertKind, AlertSender, AlertSeverity};
use crate::error::{ReconcileError, Result};
use crate::model::{
    CampaignStatus, InboundEvent, InboundType, LeadStatus, Mailbox, MailboxStatus, ReplyCategory,
};
use crate::provider::FetchedInbound;
use crate::shared::{ReputationCounts, SharedStore};
use crate::store::Database;

/// Reputation sample size below which the bounce-rate gate never fires.
const BOUNCE_RATE_MIN_SENDS: u64 = 20;

/// Classifies the intent of a human reply.
///
/// The default keyword matcher is deliberately conservative; a deployment
/// can plug in an LLM-backed classifier behind the same trait.
#[async_trait]
pub trait ReplyClassifier: Send + Sync {
    async fn classify(&self, subject: Option<&str>, body: Option<&str>) -> ReplyCategory;
}

/// Keyword-based classifier. Only explicit opt-out phrasing maps to
/// `Unsubscribe`; everything else stays a reply.
#[derive(Debug, Default, Clone)]
pub struct KeywordClassifier;

#[async_trait]
impl ReplyClassifier for KeywordClassifier {
    async fn classify(&self, subject: Option<&str>, body: Option<&str>) -> ReplyCategory {
        let text = format!(
            "{} {}",
            subject.unwrap_or_default(),
            body.unwrap_or_default()
        )
        .to_lowercase();

        const OPT_OUT: &[&str] = &[
            "unsubscribe",
            "remove me",
            "take me off",
            "stop emailing",
            "opt out",
        ];
        if OPT_OUT.iter().any(|kw| text.contains(kw)) {
            return ReplyCategory::Unsubscribe;
        }
        const NEGATIVE: &[&str] = &["not interested", "no thanks", "no thank you"];
        if NEGATIVE.iter().any(|kw| text.contains(kw)) {
            return ReplyCategory::NotInterested;
        }
        const POSITIVE: &[&str] = &["interested", "tell me more", "let's talk", "sounds good"];
        if POSITIVE.iter().any(|kw| text.contains(kw)) {
            return ReplyCategory::Interested;
        }
        ReplyCategory::Neutral
    }
}

/// Applies the campaign auto-pause rule to freshly updated reputation
/// counters. Both sides of the ratio can cross the threshold: a bounce
/// raises the rate, and the send that lifts the sample past the floor can
/// expose a rate that was already too high. The reconciler and the delivery
/// worker therefore share this check.
#[derive(Clone)]
pub struct ReputationMonitor {
    db: Arc<dyn Database>,
    alerts: AlertSender,
}

impl ReputationMonitor {
    pub fn new(db: Arc<dyn Database>, alerts: AlertSender) -> Self {
        Self { db, alerts }
    }

    pub async fn evaluate(
        &self,
        workspace_id: Uuid,
        campaign_id: Uuid,
        counts: ReputationCounts,
    ) -> Result<()> {
        if counts.sent <= BOUNCE_RATE_MIN_SENDS {
            return Ok(());
        }
        let Some(campaign) = self.db.get_campaign(campaign_id).await? else {
            return Ok(());
        };
        if counts.rate_pct() >= campaign.settings.auto_pause_bounce_pct
            && campaign.status == CampaignStatus::Active
        {
            self.db
                .update_campaign_status(campaign_id, CampaignStatus::Paused)
                .await?;
            self.alerts.send(
                Alert::new(
                    AlertSeverity::Critical,
                    AlertKind::BounceRateExceeded,
                    format!(
                        "Campaign '{}' paused: bounce rate {:.1}% over {} sends",
                        campaign.name,
                        counts.rate_pct(),
                        counts.sent
                    ),
                )
                .workspace(workspace_id)
                .campaign(campaign_id),
            );
        }
        Ok(())
    }
}

/// What ingestion did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sight of this provider message id; effects applied.
    Applied {
        event_type: InboundType,
        lead_status: Option<LeadStatus>,
    },
    /// Seen before; nothing changed.
    Duplicate,
}

pub struct Reconciler {
    db: Arc<dyn Database>,
    shared: Arc<dyn SharedStore>,
    alerts: AlertSender,
    classifier: Arc<dyn ReplyClassifier>,
    reputation: ReputationMonitor,
}

impl Reconciler {
    pub fn new(
        db: Arc<dyn Database>,
        shared: Arc<dyn SharedStore>,
        alerts: AlertSender,
        classifier: Arc<dyn ReplyClassifier>,
    ) -> Self {
        let reputation = ReputationMonitor::new(Arc::clone(&db), alerts.clone());
        Self {
            db,
            shared,
            alerts,
            classifier,
            reputation,
        }
    }

    /// Classify and ingest a message pulled from a mailbox inbox.
    pub async fn ingest_fetched(
        &self,
        mailbox: &Mailbox,
        inbound: &FetchedInbound,
    ) -> Result<IngestOutcome> {
        let event_type = classify_inbound(inbound);
        let event = InboundEvent {
            id: Uuid::new_v4(),
            workspace_id: mailbox.workspace_id,
            provider_message_id: inbound.provider_message_id.clone(),
            event_type,
            mailbox_id: Some(mailbox.id),
            log_id: inbound.correlation_id(),
            lead_id: None,
            from_address: inbound.from_address.clone(),
            subject: inbound.subject.clone(),
            body: inbound.body.clone(),
            raw_reason: None,
            received_at: inbound.received_at,
        };
        self.ingest(event).await
    }

    /// Ingest a normalized inbound event (fetch loop or provider webhook).
    ///
    /// Resolution order: correlation log id first, sender address second.
    pub async fn ingest(&self, mut event: InboundEvent) -> Result<IngestOutcome> {
        // Resolve the lead and campaign this event belongs to.
        let mut campaign_id = None;
        if let Some(log_id) = event.log_id {
            if let Some(log) = self.db.get_log(log_id).await? {
                event.lead_id = Some(log.lead_id);
                event.mailbox_id = event.mailbox_id.or(Some(log.mailbox_id));
                campaign_id = Some(log.campaign_id);
            } else {
                warn!(log_id = %log_id, "Inbound correlation points at missing log");
                event.log_id = None;
            }
        }
        if event.lead_id.is_none() {
            if let Some(lead) = self
                .db
                .get_lead_by_email(event.workspace_id, &event.from_address)
                .await?
            {
                campaign_id = campaign_id.or(lead.campaign_id);
                event.lead_id = Some(lead.id);
            }
        }
        if event.lead_id.is_none() {
            return Err(ReconcileError::Unresolvable.into());
        }

        let lead_status = self.target_lead_status(&event).await;
        let lead_update = lead_status.and_then(|s| event.lead_id.map(|id| (id, s)));

        if !self.db.record_inbound(&event, lead_update).await? {
            return Ok(IngestOutcome::Duplicate);
        }

        info!(
            event_type = event.event_type.as_str(),
            lead_id = ?event.lead_id,
            from = %event.from_address,
            "Inbound event recorded"
        );

        self.apply_side_effects(&event, campaign_id).await?;
        Ok(IngestOutcome::Applied {
            event_type: event.event_type,
            lead_status,
        })
    }

    /// The lead status an event pushes toward, if any. Soft bounces are
    /// recorded but do not move the lead.
    async fn target_lead_status(&self, event: &InboundEvent) -> Option<LeadStatus> {
        match event.event_type {
            InboundType::Reply => {
                let category = self
                    .classifier
                    .classify(event.subject.as_deref(), event.body.as_deref())
                    .await;
                match category {
                    ReplyCategory::Unsubscribe => Some(LeadStatus::Unsubscribed),
                    _ => Some(LeadStatus::Replied),
                }
            }
            InboundType::HardBounce => Some(LeadStatus::Bounced),
            InboundType::SoftBounce => None,
            InboundType::SpamComplaint => Some(LeadStatus::SpamComplaint),
        }
    }

    async fn apply_side_effects(
        &self,
        event: &InboundEvent,
        campaign_id: Option<Uuid>,
    ) -> Result<()> {
        // A spam complaint takes the sending identity out of rotation
        // immediately; a human decides when it comes back.
        if event.event_type == InboundType::SpamComplaint {
            if let Some(mailbox_id) = event.mailbox_id {
                self.db
                    .update_mailbox_status(mailbox_id, MailboxStatus::Paused)
                    .await?;
                self.alerts.send(
                    Alert::new(
                        AlertSeverity::Critical,
                        AlertKind::SpamComplaint,
                        format!("Spam complaint from {}; mailbox paused", event.from_address),
                    )
                    .workspace(event.workspace_id)
                    .mailbox(mailbox_id),
                );
            }
        }

        // Hard bounces and complaints feed the campaign reputation counter.
        if matches!(
            event.event_type,
            InboundType::HardBounce | InboundType::SpamComplaint
        ) && let Some(campaign_id) = campaign_id
        {
            self.check_bounce_rate(event.workspace_id, campaign_id).await?;
        }

        Ok(())
    }

    async fn check_bounce_rate(&self, workspace_id: Uuid, campaign_id: Uuid) -> Result<()> {
        let counts = match self.shared.record_outcome(campaign_id, 0, 1).await {
            Ok(c) => c,
            Err(e) => {
                // Reputation tracking degrades, delivery does not.
                warn!(campaign_id = %campaign_id, error = %e, "Reputation counter unavailable");
                return Ok(());
            }
        };
        self.reputation.evaluate(workspace_id, campaign_id, counts).await
    }
}

/// Classify a fetched message by its envelope, before any content analysis.
pub fn classify_inbound(inbound: &FetchedInbound) -> InboundType {
    let from = inbound.from_address.to_lowercase();
    let subject = inbound
        .subject
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    if from.contains("complaints@") || subject.contains("abuse report") {
        return InboundType::SpamComplaint;
    }

    let is_dsn = from.starts_with("mailer-daemon")
        || from.starts_with("postmaster")
        || subject.contains("undeliver")
        || subject.contains("delivery status notification")
        || subject.contains("returned mail");
    if is_dsn {
        let body = inbound.body.as_deref().unwrap_or_default().to_lowercase();
        if body.contains("550")
            || body.contains("permanent")
            || body.contains("user unknown")
            || body.contains("does not exist")
        {
            return InboundType::HardBounce;
        }
        return InboundType::SoftBounce;
    }

    InboundType::Reply
}
