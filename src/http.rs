//! Public HTTP surface: the inbound webhook, tracking redirects, and the
//! one-click unsubscribe page.
//!
//! Tracking endpoints must answer fast and never block on delivery work, so
//! they verify the signature, enqueue a tracking job, and return. The
//! webhook is the one place that calls the reconciler inline: the provider
//! retries on non-2xx, so the idempotent ingest does the deduplication.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compose::LinkSigner;
use crate::error::Error;
use crate::model::{InboundEvent, InboundType, LeadStatus};
use crate::queue::{JobKind, JobQueue, TrackEvent, TrackingJob};
use crate::reconcile::{IngestOutcome, Reconciler};
use crate::store::Database;

/// 1x1 transparent GIF, served for every open-pixel hit.
const PIXEL_GIF: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\x00\x00\x00\xff\xff\xff\x21\xf9\x04\x01\x00\x00\x00\x00\x2c\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02\x44\x01\x00\x3b";

/// Shared state for all public routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<dyn Database>,
    pub queue: JobQueue,
    pub reconciler: Arc<Reconciler>,
    pub signer: LinkSigner,
    pub webhook_token: SecretString,
}

/// Build the public router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/inbound", post(inbound_webhook))
        .route("/t/open/{log_id}/{sig}", get(open_pixel))
        .route("/t/click/{log_id}/{url_hex}/{sig}", get(click_redirect))
        .route("/u/{lead_id}", get(unsubscribe))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Inbound event as posted by a provider webhook.
#[derive(Debug, Deserialize)]
pub struct InboundWebhookBody {
    pub workspace_id: Uuid,
    pub provider_message_id: String,
    pub event_type: InboundType,
    pub from_address: String,
    #[serde(default)]
    pub mailbox_id: Option<Uuid>,
    #[serde(default)]
    pub log_id: Option<Uuid>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub raw_reason: Option<String>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// POST /webhooks/inbound
///
/// Authenticated with the `x-outflow-token` header. Replays return 200 with
/// `"duplicate"` so providers stop retrying; events that match no known
/// lead return 422.
async fn inbound_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<InboundWebhookBody>,
) -> Response {
    let presented = headers
        .get("x-outflow-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    // Constant-time comparison: a byte-by-byte mismatch must not leak how
    // much of the token was right.
    let authorized: bool = presented
        .as_bytes()
        .ct_eq(state.webhook_token.expose_secret().as_bytes())
        .into();
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let event = InboundEvent {
        id: Uuid::new_v4(),
        workspace_id: payload.workspace_id,
        provider_message_id: payload.provider_message_id,
        event_type: payload.event_type,
        mailbox_id: payload.mailbox_id,
        log_id: payload.log_id,
        lead_id: None,
        from_address: payload.from_address,
        subject: payload.subject,
        body: payload.body,
        raw_reason: payload.raw_reason,
        received_at: payload.received_at.unwrap_or_else(Utc::now),
    };

    match state.reconciler.ingest(event).await {
        Ok(IngestOutcome::Applied { event_type, .. }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "result": "applied",
                "event_type": event_type.as_str(),
            })),
        )
            .into_response(),
        Ok(IngestOutcome::Duplicate) => (
            StatusCode::OK,
            Json(serde_json::json!({"result": "duplicate"})),
        )
            .into_response(),
        Err(Error::Reconcile(crate::error::ReconcileError::Unresolvable)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": "event matches no known lead"})),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Webhook ingest failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /t/open/{log_id}/{sig}
///
/// Always serves the pixel; an invalid signature just records nothing, so
/// probing the endpoint reveals nothing about which ids exist.
async fn open_pixel(
    State(state): State<ApiState>,
    Path((log_id, sig)): Path<(Uuid, String)>,
) -> Response {
    if state.signer.verify_open(log_id, &sig) {
        let job = TrackingJob {
            log_id,
            event: TrackEvent::Open,
        };
        if let Err(e) = state
            .queue
            .enqueue(JobKind::Tracking, &job, std::time::Duration::ZERO)
            .await
        {
            warn!(log_id = %log_id, error = %e, "Failed to enqueue open event");
        }
    } else {
        debug!(log_id = %log_id, "Open pixel hit with bad signature");
    }

    ([(header::CONTENT_TYPE, "image/gif")], PIXEL_GIF).into_response()
}

/// GET /t/click/{log_id}/{url_hex}/{sig}
///
/// The destination travels hex-encoded in the path and the signature covers
/// the decoded URL, so a tampered destination fails verification.
async fn click_redirect(
    State(state): State<ApiState>,
    Path((log_id, url_hex, sig)): Path<(Uuid, String, String)>,
) -> Response {
    let url = match hex::decode(&url_hex).map(|b| String::from_utf8(b)) {
        Ok(Ok(url)) => url,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    if !state.signer.verify_click(log_id, &url, &sig) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let job = TrackingJob {
        log_id,
        event: TrackEvent::Click,
    };
    if let Err(e) = state
        .queue
        .enqueue(JobKind::Tracking, &job, std::time::Duration::ZERO)
        .await
    {
        warn!(log_id = %log_id, error = %e, "Failed to enqueue click event");
    }

    Redirect::temporary(&url).into_response()
}

/// GET /u/{lead_id}
///
/// One-click unsubscribe. Idempotent: a second visit finds the lead already
/// unsubscribed and shows the same page.
async fn unsubscribe(State(state): State<ApiState>, Path(lead_id): Path<Uuid>) -> Response {
    match state
        .db
        .update_lead_status_if_stronger(lead_id, LeadStatus::Unsubscribed)
        .await
    {
        Ok(_) => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            "<html><body><p>You have been unsubscribed and will receive no further emails.</p></body></html>",
        )
            .into_response(),
        Err(e) => {
            warn!(lead_id = %lead_id, error = %e, "Unsubscribe failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSender;
    use crate::model::{Campaign, CampaignSettings, CampaignStatus, Lead};
    use crate::queue::{BackoffPolicy, JobStatus};
    use crate::reconcile::KeywordClassifier;
    use crate::shared::{MemorySharedStore, SharedStore};
    use crate::store::LibSqlBackend;
    use std::collections::HashMap;

    struct Fixture {
        state: ApiState,
        db: Arc<dyn Database>,
        lead: Lead,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let shared: Arc<dyn SharedStore> = Arc::new(MemorySharedStore::new());
        let queue = JobQueue::new(Arc::clone(&db), 3, BackoffPolicy::default());
        let (alerts, _rx) = AlertSender::channel();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&db),
            shared,
            alerts,
            Arc::new(KeywordClassifier),
        ));

        let workspace_id = Uuid::new_v4();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            workspace_id,
            name: "Launch".into(),
            status: CampaignStatus::Active,
            settings: CampaignSettings::default(),
            mailbox_ids: vec![],
        };
        db.insert_campaign(&campaign).await.unwrap();
        let lead = Lead {
            id: Uuid::new_v4(),
            workspace_id,
            email: "lead@example.com".into(),
            status: LeadStatus::Sent,
            campaign_id: Some(campaign.id),
            last_event_at: None,
            tags: vec![],
            custom_fields: HashMap::new(),
        };
        db.insert_lead(&lead).await.unwrap();

        let state = ApiState {
            db: Arc::clone(&db),
            queue,
            reconciler,
            signer: LinkSigner::new(SecretString::from("signing-secret")),
            webhook_token: SecretString::from("hook-token"),
        };
        Fixture { state, db, lead }
    }

    fn webhook_body(f: &Fixture, provider_id: &str) -> InboundWebhookBody {
        InboundWebhookBody {
            workspace_id: f.lead.workspace_id,
            provider_message_id: provider_id.into(),
            event_type: InboundType::Reply,
            from_address: f.lead.email.clone(),
            mailbox_id: None,
            log_id: None,
            subject: Some("Re: hi".into()),
            body: Some("sounds good".into()),
            raw_reason: None,
            received_at: None,
        }
    }

    fn token_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-outflow-token", token.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn webhook_rejects_bad_token() {
        let f = fixture().await;
        let res = inbound_webhook(
            State(f.state.clone()),
            token_headers("wrong"),
            Json(webhook_body(&f, "<w1@remote>")),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_rejects_token_with_matching_prefix() {
        let f = fixture().await;
        let res = inbound_webhook(
            State(f.state.clone()),
            token_headers("hook-token-and-then-some"),
            Json(webhook_body(&f, "<w4@remote>")),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_applies_then_deduplicates() {
        let f = fixture().await;
        let res = inbound_webhook(
            State(f.state.clone()),
            token_headers("hook-token"),
            Json(webhook_body(&f, "<w2@remote>")),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let lead = f.db.get_lead(f.lead.id).await.unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::Replied);

        let res = inbound_webhook(
            State(f.state.clone()),
            token_headers("hook-token"),
            Json(webhook_body(&f, "<w2@remote>")),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_unknown_sender_is_422() {
        let f = fixture().await;
        let mut body = webhook_body(&f, "<w3@remote>");
        body.from_address = "stranger@nowhere.test".into();
        let res = inbound_webhook(
            State(f.state.clone()),
            token_headers("hook-token"),
            Json(body),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn valid_open_hit_serves_pixel_and_enqueues() {
        let f = fixture().await;
        let log_id = Uuid::new_v4();
        let sig = f.state.signer.sign_open(log_id);
        let res = open_pixel(State(f.state.clone()), Path((log_id, sig))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            f.db.count_jobs(JobKind::Tracking, JobStatus::Queued)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn forged_open_hit_serves_pixel_but_records_nothing() {
        let f = fixture().await;
        let res = open_pixel(
            State(f.state.clone()),
            Path((Uuid::new_v4(), "deadbeef".to_string())),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            f.db.count_jobs(JobKind::Tracking, JobStatus::Queued)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn click_redirects_to_signed_destination() {
        let f = fixture().await;
        let log_id = Uuid::new_v4();
        let url = "https://example.com/pricing";
        let sig = f.state.signer.sign_click(log_id, url);
        let res = click_redirect(
            State(f.state.clone()),
            Path((log_id, hex::encode(url.as_bytes()), sig)),
        )
        .await;
        assert_eq!(res.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            res.headers().get(header::LOCATION).unwrap(),
            "https://example.com/pricing"
        );
        assert_eq!(
            f.db.count_jobs(JobKind::Tracking, JobStatus::Queued)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn tampered_click_destination_is_rejected() {
        let f = fixture().await;
        let log_id = Uuid::new_v4();
        let sig = f.state.signer.sign_click(log_id, "https://example.com/pricing");
        let res = click_redirect(
            State(f.state.clone()),
            Path((
                log_id,
                hex::encode("https://evil.test/phish".as_bytes()),
                sig,
            )),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let f = fixture().await;
        let res = unsubscribe(State(f.state.clone()), Path(f.lead.id)).await;
        assert_eq!(res.status(), StatusCode::OK);
        let lead = f.db.get_lead(f.lead.id).await.unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::Unsubscribed);

        let res = unsubscribe(State(f.state.clone()), Path(f.lead.id)).await;
        assert_eq!(res.status(), StatusCode::OK);
        let lead = f.db.get_lead(f.lead.id).await.unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::Unsubscribed);
    }
}
