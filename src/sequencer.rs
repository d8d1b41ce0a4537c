//! Campaign sequencer — periodic scan that turns due sequence steps into
//! send jobs.
//!
//! A scan walks every active campaign: for each schedulable lead it works
//! out the next due step from the lead's latest sending log, picks a mailbox
//! with available quota, writes a queued sending log, and enqueues a send
//! job. The quota check here is a non-consuming peek; the delivery worker
//! performs the authoritative consume at dispatch time. On top of the
//! per-mailbox quotas, a campaign schedules at most its own daily limit of
//! sends per UTC day.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::limiter::QuotaStore;
use crate::model::{Campaign, Lead, LogStatus, Mailbox, SendWindow, SendingLog, SequenceStep};
use crate::queue::{JobKind, JobQueue, SendJob};
use crate::scheduler::{SendTimingRules, next_allowed_send_delay};
use crate::shared::SharedStore;
use crate::store::Database;

/// What one scan pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub campaigns_scanned: usize,
    pub sends_scheduled: usize,
}

pub struct Sequencer {
    db: Arc<dyn Database>,
    quota: QuotaStore,
    queue: JobQueue,
}

impl Sequencer {
    pub fn new(db: Arc<dyn Database>, shared: Arc<dyn SharedStore>, queue: JobQueue) -> Self {
        Self {
            db,
            quota: QuotaStore::new(shared),
            queue,
        }
    }

    /// Run one full scan pass.
    pub async fn scan<R: Rng + Send>(
        &self,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();

        for campaign in self.db.list_active_campaigns().await? {
            summary.campaigns_scanned += 1;

            let steps = self.db.list_steps(campaign.id).await?;
            if steps.is_empty() {
                continue;
            }

            // The campaign cap counts logs written since UTC midnight,
            // independent of which mailbox carried them.
            let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
            let mut scheduled_today = self.db.count_logs_since(campaign.id, day_start).await?;

            let leads = self.db.list_schedulable_leads(campaign.id).await?;
            for lead in leads {
                if scheduled_today >= u64::from(campaign.settings.daily_limit) {
                    debug!(campaign_id = %campaign.id, "Campaign daily cap reached");
                    break;
                }
                let Some(step) = self.next_due_step(&campaign, &lead, &steps, now).await? else {
                    continue;
                };

                // No mailbox in the pool has quota left: the whole campaign
                // is blocked, so stop scanning it this round.
                let Some(mailbox) = self.pick_mailbox(&campaign, now).await? else {
                    debug!(campaign_id = %campaign.id, "No mailbox with available quota");
                    break;
                };

                self.schedule_send(&campaign, &lead, step, &mailbox, now, rng)
                    .await?;
                scheduled_today += 1;
                summary.sends_scheduled += 1;
            }
        }

        Ok(summary)
    }

    /// The step that is due for this lead right now, if any.
    async fn next_due_step<'a>(
        &self,
        campaign: &Campaign,
        lead: &Lead,
        steps: &'a [SequenceStep],
        now: DateTime<Utc>,
    ) -> Result<Option<&'a SequenceStep>> {
        let latest = self.db.latest_log_for_lead(campaign.id, lead.id).await?;

        let Some(log) = latest else {
            // Never contacted: the first step is due immediately.
            return Ok(steps.first());
        };

        match log.status {
            // A send is already in flight or dead-lettered; either way the
            // sequencer must not stack another one on top.
            LogStatus::Queued | LogStatus::Failed | LogStatus::Skipped => Ok(None),
            LogStatus::Sent => {
                let Some(idx) = steps.iter().position(|s| s.id == log.step_id) else {
                    warn!(log_id = %log.id, "Sent log references unknown step");
                    return Ok(None);
                };
                let Some(next) = steps.get(idx + 1) else {
                    // Sequence exhausted for this lead.
                    return Ok(None);
                };

                let sent_at = log.sent_at.unwrap_or(log.created_at);
                let due = sent_at
                    + chrono::Duration::days(i64::from(next.delay_days))
                    + chrono::Duration::minutes(i64::from(next.wait_minutes.unwrap_or(0)));
                if now < due {
                    return Ok(None);
                }
                Ok(Some(next))
            }
        }
    }

    /// First active mailbox from the campaign pool whose quota currently
    /// allows a send.
    async fn pick_mailbox(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Result<Option<Mailbox>> {
        for mailbox_id in &campaign.mailbox_ids {
            let Some(mailbox) = self.db.get_mailbox(*mailbox_id).await? else {
                warn!(mailbox_id = %mailbox_id, "Campaign references missing mailbox");
                continue;
            };
            if !mailbox.is_active() {
                continue;
            }
            if self.quota.can_send(&mailbox, now).await.is_allowed() {
                return Ok(Some(mailbox));
            }
        }
        Ok(None)
    }

    async fn schedule_send<R: Rng + Send>(
        &self,
        campaign: &Campaign,
        lead: &Lead,
        step: &SequenceStep,
        mailbox: &Mailbox,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<()> {
        let mut rules = SendTimingRules::from_campaign(&campaign.settings, mailbox);
        if let Some(at) = step.send_at {
            // A fixed send time is a one-slot window.
            rules.send_window = Some(SendWindow { start: at, end: at });
        }
        let delay = next_allowed_send_delay(now, &rules, rng);

        let log = SendingLog::new(
            campaign.workspace_id,
            campaign.id,
            lead.id,
            mailbox.id,
            step.id,
        );
        let log_id = log.id;
        self.db.insert_log(&log).await?;
        self.db
            .update_lead_status_if_stronger(lead.id, crate::model::LeadStatus::Queued)
            .await?;
        self.queue
            .enqueue(JobKind::Send, &SendJob { log_id }, delay)
            .await?;

        info!(
            campaign_id = %campaign.id,
            lead_id = %lead.id,
            mailbox_id = %mailbox.id,
            step = step.order,
            delay_secs = delay.as_secs(),
            "Send scheduled"
        );
        Ok(())
    }

    /// Spawn the periodic scan loop. Set the returned flag to stop.
    pub fn spawn_scan_loop(
        self: Arc<Self>,
        interval: Duration,
    ) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Sequencer scan loop started");
            let mut tick = tokio::time::interval(interval);
            let mut rng = StdRng::from_entropy();

            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    info!("Sequencer scan loop shutting down");
                    return;
                }
                match self.scan(Utc::now(), &mut rng).await {
                    Ok(summary) if summary.sends_scheduled > 0 => {
                        debug!(
                            campaigns = summary.campaigns_scanned,
                            scheduled = summary.sends_scheduled,
                            "Scan pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Sequencer scan failed"),
                }
            }
        });

        (handle, shutdown_flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CampaignSettings, CampaignStatus, LeadStatus, MailboxCredentials, MailboxStatus,
    };
    use crate::queue::{BackoffPolicy, Job, JobStatus};
    use crate::shared::MemorySharedStore;
    use secrecy::SecretString;
    use std::collections::HashMap;
    use uuid::Uuid;

    struct Fixture {
        db: Arc<dyn Database>,
        sequencer: Sequencer,
        campaign: Campaign,
        steps: Vec<SequenceStep>,
        lead: Lead,
        mailbox: Mailbox,
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    async fn fixture(daily_limit: u32) -> Fixture {
        let db: Arc<dyn Database> =
            Arc::new(crate::store::LibSqlBackend::new_memory().await.unwrap());
        let shared: Arc<dyn SharedStore> = Arc::new(MemorySharedStore::new());
        let queue = JobQueue::new(Arc::clone(&db), 3, BackoffPolicy::default());

        let ws = Uuid::new_v4();
        let mailbox = Mailbox {
            id: Uuid::new_v4(),
            workspace_id: ws,
            email: "sender@example.com".into(),
            status: MailboxStatus::Active,
            daily_limit,
            hourly_limit: 100,
            min_delay_secs: 0,
            max_delay_secs: 0,
            warmup_enabled: false,
            last_sync_at: None,
            credentials: MailboxCredentials {
                smtp_host: "smtp.example.com".into(),
                smtp_port: 587,
                imap_host: "imap.example.com".into(),
                imap_port: 993,
                username: "sender@example.com".into(),
                password: SecretString::from("pw"),
            },
        };
        db.insert_mailbox(&mailbox).await.unwrap();

        let campaign = Campaign {
            id: Uuid::new_v4(),
            workspace_id: ws,
            name: "Launch".into(),
            status: CampaignStatus::Active,
            settings: CampaignSettings::default(),
            mailbox_ids: vec![mailbox.id],
        };
        db.insert_campaign(&campaign).await.unwrap();

        let mut steps = Vec::new();
        for (order, delay_days) in [(0u32, 0u32), (1, 3)] {
            let step = SequenceStep {
                id: Uuid::new_v4(),
                campaign_id: campaign.id,
                order,
                subject: format!("Step {order}"),
                body: "Hi {{first_name}}".into(),
                delay_days,
                wait_minutes: None,
                send_at: None,
            };
            db.insert_step(&step).await.unwrap();
            steps.push(step);
        }

        let lead = Lead {
            id: Uuid::new_v4(),
            workspace_id: ws,
            email: "lead@example.com".into(),
            status: LeadStatus::Unassigned,
            campaign_id: Some(campaign.id),
            last_event_at: None,
            tags: vec![],
            custom_fields: HashMap::new(),
        };
        db.insert_lead(&lead).await.unwrap();

        let sequencer = Sequencer::new(Arc::clone(&db), shared, queue);
        Fixture {
            db,
            sequencer,
            campaign,
            steps,
            lead,
            mailbox,
        }
    }

    async fn claim_one(db: &Arc<dyn Database>) -> Option<Job> {
        db.claim_due_jobs(JobKind::Send, 10, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap()
            .into_iter()
            .next()
    }

    #[tokio::test]
    async fn fresh_lead_gets_first_step_scheduled() {
        let f = fixture(40).await;
        let summary = f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();
        assert_eq!(summary.sends_scheduled, 1);

        let job = claim_one(&f.db).await.expect("a send job");
        let payload: SendJob = job.parse_payload().unwrap();
        let log = f.db.get_log(payload.log_id).await.unwrap().unwrap();
        assert_eq!(log.step_id, f.steps[0].id);
        assert_eq!(log.lead_id, f.lead.id);
        assert_eq!(log.mailbox_id, f.mailbox.id);

        let lead = f.db.get_lead(f.lead.id).await.unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::Queued);
    }

    #[tokio::test]
    async fn pending_send_blocks_rescheduling() {
        let f = fixture(40).await;
        f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();

        // Second scan while the first send is still queued.
        let summary = f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();
        assert_eq!(summary.sends_scheduled, 0);
        assert_eq!(
            f.db.count_jobs(JobKind::Send, JobStatus::Queued).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn follow_up_waits_for_step_delay() {
        let f = fixture(40).await;

        // Step 0 already sent one day ago; step 1 wants 3 days.
        let mut log = SendingLog::new(
            f.campaign.workspace_id,
            f.campaign.id,
            f.lead.id,
            f.mailbox.id,
            f.steps[0].id,
        );
        log.created_at = Utc::now() - chrono::Duration::days(1);
        f.db.insert_log(&log).await.unwrap();
        f.db.mark_log_sent(log.id, "<m1@x>", Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();

        let summary = f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();
        assert_eq!(summary.sends_scheduled, 0);
    }

    #[tokio::test]
    async fn follow_up_fires_once_delay_elapsed() {
        let f = fixture(40).await;

        let log = SendingLog::new(
            f.campaign.workspace_id,
            f.campaign.id,
            f.lead.id,
            f.mailbox.id,
            f.steps[0].id,
        );
        f.db.insert_log(&log).await.unwrap();
        f.db.mark_log_sent(log.id, "<m1@x>", Utc::now() - chrono::Duration::days(4))
            .await
            .unwrap();

        let summary = f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();
        assert_eq!(summary.sends_scheduled, 1);

        let job = claim_one(&f.db).await.unwrap();
        let payload: SendJob = job.parse_payload().unwrap();
        let new_log = f.db.get_log(payload.log_id).await.unwrap().unwrap();
        assert_eq!(new_log.step_id, f.steps[1].id);
    }

    #[tokio::test]
    async fn completed_sequence_schedules_nothing() {
        let f = fixture(40).await;

        let log = SendingLog::new(
            f.campaign.workspace_id,
            f.campaign.id,
            f.lead.id,
            f.mailbox.id,
            f.steps[1].id,
        );
        f.db.insert_log(&log).await.unwrap();
        f.db.mark_log_sent(log.id, "<m2@x>", Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();

        let summary = f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();
        assert_eq!(summary.sends_scheduled, 0);
    }

    #[tokio::test]
    async fn campaign_daily_limit_caps_scheduling() {
        let f = fixture(40).await;
        // Take the fixture lead out of play so only the capped campaign
        // schedules anything.
        f.db.update_lead_status_if_stronger(f.lead.id, LeadStatus::Unsubscribed)
            .await
            .unwrap();

        let mut settings = CampaignSettings::default();
        settings.daily_limit = 2;
        let campaign = Campaign {
            id: Uuid::new_v4(),
            workspace_id: f.campaign.workspace_id,
            name: "Capped".into(),
            status: CampaignStatus::Active,
            settings,
            mailbox_ids: vec![f.mailbox.id],
        };
        f.db.insert_campaign(&campaign).await.unwrap();
        f.db.insert_step(&SequenceStep {
            id: Uuid::new_v4(),
            campaign_id: campaign.id,
            order: 0,
            subject: "Hi".into(),
            body: "Hi".into(),
            delay_days: 0,
            wait_minutes: None,
            send_at: None,
        })
        .await
        .unwrap();
        for i in 0..3 {
            f.db.insert_lead(&Lead {
                id: Uuid::new_v4(),
                workspace_id: campaign.workspace_id,
                email: format!("lead{i}@capped.test"),
                status: LeadStatus::Unassigned,
                campaign_id: Some(campaign.id),
                last_event_at: None,
                tags: vec![],
                custom_fields: HashMap::new(),
            })
            .await
            .unwrap();
        }

        let summary = f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();
        assert_eq!(summary.sends_scheduled, 2);

        // The third lead stays unscheduled for the rest of the UTC day,
        // even though the mailbox has quota left.
        let summary = f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();
        assert_eq!(summary.sends_scheduled, 0);
    }

    #[tokio::test]
    async fn exhausted_quota_stops_the_campaign_scan() {
        let f = fixture(0).await;
        let summary = f.sequencer.scan(Utc::now(), &mut rng()).await.unwrap();
        assert_eq!(summary.campaigns_scanned, 1);
        assert_eq!(summary.sends_scheduled, 0);
        assert!(claim_one(&f.db).await.is_none());
    }
}
