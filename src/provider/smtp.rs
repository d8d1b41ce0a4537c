//! SMTP/IMAP provider — lettre for outbound, raw IMAP over TLS for inbound.
//!
//! Both directions are blocking socket work and run under `spawn_blocking`.
//! The IMAP side speaks just enough of the protocol to LOGIN, SELECT,
//! SEARCH UNSEEN, FETCH, and flag messages seen.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::model::{Mailbox, MailboxCredentials};
use crate::provider::{FetchedInbound, OutboundEmail, ProviderAdapter, SendReceipt};

/// One-click unsubscribe header (RFC 2369).
#[derive(Debug, Clone)]
struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Stateless SMTP/IMAP adapter; a single instance serves every mailbox.
#[derive(Debug, Default, Clone)]
pub struct SmtpImapProvider;

impl SmtpImapProvider {
    pub fn new() -> Self {
        Self
    }
}

fn build_transport(creds: &MailboxCredentials) -> Result<SmtpTransport, ProviderError> {
    Ok(SmtpTransport::relay(&creds.smtp_host)
        .map_err(|e| ProviderError::Transient {
            reason: format!("SMTP relay setup: {e}"),
        })?
        .port(creds.smtp_port)
        .credentials(Credentials::new(
            creds.username.clone(),
            creds.password.expose_secret().to_string(),
        ))
        .build())
}

fn classify_smtp_error(mailbox_id: Uuid, e: &lettre::transport::smtp::Error) -> ProviderError {
    if e.to_string().contains("authentication") {
        ProviderError::Auth { mailbox_id }
    } else if e.is_permanent() {
        ProviderError::Permanent {
            reason: e.to_string(),
        }
    } else {
        ProviderError::Transient {
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for SmtpImapProvider {
    async fn validate_credentials(&self, mailbox: &Mailbox) -> Result<(), ProviderError> {
        let creds = mailbox.credentials.clone();
        let mailbox_id = mailbox.id;
        tokio::task::spawn_blocking(move || {
            let transport = build_transport(&creds)?;
            match transport.test_connection() {
                Ok(true) => Ok(()),
                Ok(false) => Err(ProviderError::Auth { mailbox_id }),
                Err(e) => Err(classify_smtp_error(mailbox_id, &e)),
            }
        })
        .await
        .map_err(|e| ProviderError::Transient {
            reason: format!("validation task: {e}"),
        })?
    }

    async fn send(
        &self,
        mailbox: &Mailbox,
        email: &OutboundEmail,
    ) -> Result<SendReceipt, ProviderError> {
        let creds = mailbox.credentials.clone();
        let from = mailbox.email.clone();
        let mailbox_id = mailbox.id;
        let email = email.clone();

        tokio::task::spawn_blocking(move || {
            let transport = build_transport(&creds)?;

            let mut builder = Message::builder()
                .from(from.parse().map_err(|_| ProviderError::InvalidAddress {
                    address: from.clone(),
                })?)
                .to(email
                    .to
                    .parse()
                    .map_err(|_| ProviderError::InvalidAddress {
                        address: email.to.clone(),
                    })?)
                .subject(&email.subject)
                .message_id(Some(format!("<{}>", email.message_id)))
                .header(ContentType::TEXT_HTML);
            if let Some(url) = &email.unsubscribe_url {
                builder = builder.header(ListUnsubscribe(format!("<{url}>")));
            }

            let message = builder.body(email.html_body.clone()).map_err(|e| {
                ProviderError::Permanent {
                    reason: format!("message build: {e}"),
                }
            })?;

            transport
                .send(&message)
                .map_err(|e| classify_smtp_error(mailbox_id, &e))?;

            debug!(to = %email.to, message_id = %email.message_id, "Email dispatched");
            Ok(SendReceipt {
                provider_message_id: format!("<{}>", email.message_id),
                accepted_at: Utc::now(),
            })
        })
        .await
        .map_err(|e| ProviderError::Transient {
            reason: format!("send task: {e}"),
        })?
    }

    async fn fetch_inbound(&self, mailbox: &Mailbox) -> Result<Vec<FetchedInbound>, ProviderError> {
        let creds = mailbox.credentials.clone();
        let mailbox_id = mailbox.id;
        tokio::task::spawn_blocking(move || fetch_unseen_imap(mailbox_id, &creds))
            .await
            .map_err(|e| ProviderError::Transient {
                reason: format!("fetch task: {e}"),
            })?
    }

    async fn health_check(&self, mailbox: &Mailbox) -> Result<(), ProviderError> {
        let creds = mailbox.credentials.clone();
        let ok = tokio::task::spawn_blocking(move || {
            TcpStream::connect((&*creds.smtp_host, creds.smtp_port)).is_ok()
                && TcpStream::connect((&*creds.imap_host, creds.imap_port)).is_ok()
        })
        .await
        .unwrap_or(false);

        if ok {
            Ok(())
        } else {
            Err(ProviderError::Transient {
                reason: format!("mailbox {} unreachable", mailbox.email),
            })
        }
    }
}

// ── Raw IMAP (blocking) ─────────────────────────────────────────────

type ImapError = Box<dyn std::error::Error + Send + Sync>;
type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn fetch_unseen_imap(
    mailbox_id: Uuid,
    creds: &MailboxCredentials,
) -> Result<Vec<FetchedInbound>, ProviderError> {
    fetch_unseen_inner(creds).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("login failed") {
            ProviderError::Auth { mailbox_id }
        } else {
            ProviderError::Transient { reason: msg }
        }
    })
}

fn fetch_unseen_inner(creds: &MailboxCredentials) -> Result<Vec<FetchedInbound>, ImapError> {
    let tcp = TcpStream::connect((&*creds.imap_host, creds.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(creds.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let _greeting = read_line(&mut tls)?;

    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            creds.username,
            creds.password.expose_secret()
        ),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    let search_resp = send_cmd(&mut tls, "A3", "SEARCH UNSEEN")?;
    let mut uids: Vec<String> = Vec::new();
    for line in &search_resp {
        if line.starts_with("* SEARCH") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 2 {
                uids.extend(parts[2..].iter().map(|s| s.to_string()));
            }
        }
    }

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in &uids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &format!("FETCH {uid} RFC822"))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
            results.push(parsed_to_inbound(&parsed));
        } else {
            warn!(uid = %uid, "Skipping unparseable message");
        }

        let store_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let _ = send_cmd(&mut tls, &store_tag, &format!("STORE {uid} +FLAGS (\\Seen)"));
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

fn read_line(tls: &mut TlsStream) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, ImapError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

// ── Message extraction ──────────────────────────────────────────────

fn parsed_to_inbound(parsed: &mail_parser::Message) -> FetchedInbound {
    let mut referenced_ids = Vec::new();
    collect_message_ids(parsed.in_reply_to(), &mut referenced_ids);
    collect_message_ids(parsed.references(), &mut referenced_ids);

    FetchedInbound {
        provider_message_id: parsed
            .message_id()
            .map(|s| format!("<{s}>"))
            .unwrap_or_else(|| format!("<gen-{}@unknown>", Uuid::new_v4())),
        from_address: extract_sender(parsed),
        subject: parsed.subject().map(|s| s.to_string()),
        body: Some(extract_text(parsed)),
        referenced_ids,
        received_at: extract_date(parsed),
    }
}

fn collect_message_ids(value: &mail_parser::HeaderValue, out: &mut Vec<String>) {
    if let Some(list) = value.as_text_list() {
        out.extend(list.iter().map(|s| format!("<{s}>")));
    } else if let Some(text) = value.as_text() {
        out.push(format!("<{text}>"));
    }
}

fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

fn extract_date(parsed: &mail_parser::Message) -> DateTime<Utc> {
    parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(d.year as i32, u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(
                        u32::from(d.hour),
                        u32::from(d.minute),
                        u32::from(d.second),
                    )
                })
                .map(|n| n.and_utc())
        })
        .unwrap_or_else(Utc::now)
}

/// Strip HTML tags from content (basic).
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::correlation_message_id;

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
        assert_eq!(strip_html("No HTML here"), "No HTML here");
    }

    #[test]
    fn reply_carries_correlation_through_in_reply_to() {
        let log_id = Uuid::new_v4();
        let raw = format!(
            "Message-ID: <their-id@gmail.com>\r\n\
             In-Reply-To: <{}>\r\n\
             From: Lead <lead@example.com>\r\n\
             Subject: Re: quick question\r\n\
             \r\n\
             Sounds interesting, tell me more.\r\n",
            correlation_message_id(log_id)
        );
        let parsed = MessageParser::default().parse(raw.as_bytes()).unwrap();
        let inbound = parsed_to_inbound(&parsed);

        assert_eq!(inbound.from_address, "lead@example.com");
        assert_eq!(inbound.provider_message_id, "<their-id@gmail.com>");
        assert_eq!(inbound.correlation_id(), Some(log_id));
        assert!(inbound.body.as_deref().unwrap().contains("tell me more"));
    }

    #[test]
    fn unrelated_mail_has_no_correlation() {
        let raw = "Message-ID: <spam@spammer.biz>\r\n\
                   From: someone@spammer.biz\r\n\
                   Subject: Buy now\r\n\
                   \r\n\
                   Great deals!\r\n";
        let parsed = MessageParser::default().parse(raw.as_bytes()).unwrap();
        let inbound = parsed_to_inbound(&parsed);
        assert_eq!(inbound.correlation_id(), None);
    }
}
