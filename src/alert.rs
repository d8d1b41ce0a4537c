//! Operator alerts for reputation events.
//!
//! The pipeline pushes alerts onto an unbounded channel; a consumer task
//! drains it. The default consumer just logs, but the channel seam lets a
//! deployment forward critical alerts to a pager or chat webhook instead.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// A spam complaint paused a mailbox.
    SpamComplaint,
    /// Bounce rate crossed the campaign threshold and paused it.
    BounceRateExceeded,
    /// A mailbox failed its health probe.
    MailboxUnhealthy,
    /// A job exhausted its attempts.
    JobDead,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub workspace_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub mailbox_id: Option<Uuid>,
    pub message: String,
}

impl Alert {
    pub fn new(severity: AlertSeverity, kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            workspace_id: None,
            campaign_id: None,
            mailbox_id: None,
            message: message.into(),
        }
    }

    pub fn workspace(mut self, id: Uuid) -> Self {
        self.workspace_id = Some(id);
        self
    }

    pub fn campaign(mut self, id: Uuid) -> Self {
        self.campaign_id = Some(id);
        self
    }

    pub fn mailbox(mut self, id: Uuid) -> Self {
        self.mailbox_id = Some(id);
        self
    }
}

/// Cloneable alert submission handle.
#[derive(Clone)]
pub struct AlertSender {
    tx: mpsc::UnboundedSender<Alert>,
}

impl AlertSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Best-effort: a closed consumer never blocks the pipeline.
    pub fn send(&self, alert: Alert) {
        if self.tx.send(alert).is_err() {
            warn!("Alert consumer closed; dropping alert");
        }
    }
}

/// Consume alerts into structured log lines.
pub fn spawn_log_consumer(mut rx: mpsc::UnboundedReceiver<Alert>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(alert) = rx.recv().await {
            let kind = format!("{:?}", alert.kind);
            match alert.severity {
                AlertSeverity::Info => info!(
                    kind,
                    mailbox_id = ?alert.mailbox_id,
                    campaign_id = ?alert.campaign_id,
                    "{}",
                    alert.message
                ),
                AlertSeverity::Warning => warn!(
                    kind,
                    mailbox_id = ?alert.mailbox_id,
                    campaign_id = ?alert.campaign_id,
                    "{}",
                    alert.message
                ),
                AlertSeverity::Critical => error!(
                    kind,
                    mailbox_id = ?alert.mailbox_id,
                    campaign_id = ?alert.campaign_id,
                    "{}",
                    alert.message
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alerts_flow_through_the_channel() {
        let (sender, mut rx) = AlertSender::channel();
        let mailbox_id = Uuid::new_v4();
        sender.send(
            Alert::new(
                AlertSeverity::Critical,
                AlertKind::SpamComplaint,
                "spam complaint against sender@example.com",
            )
            .mailbox(mailbox_id),
        );

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.kind, AlertKind::SpamComplaint);
        assert_eq!(alert.mailbox_id, Some(mailbox_id));
    }

    #[test]
    fn send_after_consumer_drop_does_not_panic() {
        let (sender, rx) = AlertSender::channel();
        drop(rx);
        sender.send(Alert::new(
            AlertSeverity::Info,
            AlertKind::JobDead,
            "late alert",
        ));
    }
}
