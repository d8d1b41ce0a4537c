//! Provider adapters — the seam between the delivery pipeline and the
//! outside world.
//!
//! Outbound messages carry a correlation token: the sending log id embedded
//! as the local part of the Message-ID header. Replies echo it back through
//! In-Reply-To/References, which is how the reconciler maps an inbound
//! message to the exact send that triggered it.

pub mod smtp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::model::Mailbox;

pub use smtp::SmtpImapProvider;

/// Domain used in generated Message-ID headers.
const MESSAGE_ID_DOMAIN: &str = "outflow.local";

/// A fully composed message ready for dispatch.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    /// Message-ID header value, without angle brackets.
    pub message_id: String,
    /// List-Unsubscribe target, when the campaign appends a footer.
    pub unsubscribe_url: Option<String>,
}

/// Provider acknowledgement of an accepted send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// A raw inbound message pulled from a mailbox, before classification.
#[derive(Debug, Clone)]
pub struct FetchedInbound {
    pub provider_message_id: String,
    pub from_address: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    /// Message ids from In-Reply-To and References, in that order.
    pub referenced_ids: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl FetchedInbound {
    /// Recover the sending log id this message replies to, if any of its
    /// referenced ids carries our correlation token.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.referenced_ids
            .iter()
            .find_map(|id| parse_correlation_id(id))
    }
}

/// Build the Message-ID value for a sending log (no angle brackets).
pub fn correlation_message_id(log_id: Uuid) -> String {
    format!("{log_id}@{MESSAGE_ID_DOMAIN}")
}

/// Parse a log id out of a message id like `<uuid@outflow.local>`.
pub fn parse_correlation_id(message_id: &str) -> Option<Uuid> {
    let trimmed = message_id.trim().trim_start_matches('<').trim_end_matches('>');
    let (local, domain) = trimmed.split_once('@')?;
    if domain != MESSAGE_ID_DOMAIN {
        return None;
    }
    Uuid::parse_str(local).ok()
}

/// Transport adapter for one mail provider technology.
///
/// Every method takes the mailbox explicitly: adapters are stateless and a
/// single instance serves all mailboxes.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Verify the mailbox credentials actually authenticate.
    async fn validate_credentials(&self, mailbox: &Mailbox) -> Result<(), ProviderError>;

    /// Dispatch one message through the mailbox.
    async fn send(
        &self,
        mailbox: &Mailbox,
        email: &OutboundEmail,
    ) -> Result<SendReceipt, ProviderError>;

    /// Pull unseen inbound messages from the mailbox.
    async fn fetch_inbound(&self, mailbox: &Mailbox) -> Result<Vec<FetchedInbound>, ProviderError>;

    /// Cheap reachability probe, used by the health check loop.
    async fn health_check(&self, mailbox: &Mailbox) -> Result<(), ProviderError>;
}
