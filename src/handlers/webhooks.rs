// Webhook handlers
//
// Public, signature-verified endpoints. Signatures are HMAC-SHA256 over the
// raw body, compared in constant time; a bad signature is a 401 with no
// side effects. Event replays are absorbed by the idempotency ledger and by
// the executor's terminal-state guard.

use actix_web::{post, web, HttpRequest, HttpResponse};
use hmac::{Hmac, Mac};
use log::{info, warn};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::ApiError;
use crate::handlers::AppContext;
use crate::providers::stt;
use crate::store::EventStore;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the STT callback signature.
const STT_SIGNATURE_HEADER: &str = "dg-signature";

/// Header carrying the subscription event signature.
const SUBSCRIPTION_SIGNATURE_HEADER: &str = "x-signature";

#[derive(Deserialize)]
pub struct SttWebhookQuery {
    task_id: String,
}

/// Subscription event envelope. The upstream payment system maps invoice
/// line items to minutes before signing the event.
#[derive(Debug, Deserialize)]
pub struct SubscriptionEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: SubscriptionData,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionData {
    pub user_id: String,
    #[serde(default)]
    pub anon_id: Option<String>,
    #[serde(default)]
    pub lines: Vec<InvoiceLine>,
}

#[derive(Debug, Deserialize)]
pub struct InvoiceLine {
    pub minutes: i64,
}

/// Verify an HMAC-SHA256 hex signature over `body` in constant time.
fn verify_signature(secret: &str, body: &[u8], provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

fn signature_header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// STT async-mode callback: the provider posts the full result document.
#[post("/webhooks/stt")]
pub async fn stt_webhook(
    req: HttpRequest,
    query: web::Query<SttWebhookQuery>,
    body: web::Bytes,
    ctx: web::Data<AppContext>,
) -> Result<HttpResponse, ApiError> {
    let Some(secret) = ctx.stt_webhook_secret.as_deref() else {
        return Err(ApiError::Unauthorized("stt webhook not configured".into()));
    };
    let signature = signature_header(&req, STT_SIGNATURE_HEADER)
        .ok_or_else(|| ApiError::Unauthorized("missing signature".into()))?;
    if !verify_signature(secret, &body, signature) {
        ctx.metrics.record_webhook("stt", "bad_signature").await;
        return Err(ApiError::Unauthorized("invalid signature".into()));
    }

    let raw: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::invalid_input("webhook body is not JSON"))?;
    let result = stt::parse_payload(raw)
        .map_err(|e| ApiError::invalid_input(format!("unrecognized payload: {e}")))?;

    match ctx
        .executor
        .finalize_from_webhook(&query.task_id, result)
        .await
    {
        Ok(()) => {
            ctx.metrics.record_webhook("stt", "ok").await;
            Ok(HttpResponse::Ok().json(serde_json::json!({ "received": true })))
        }
        Err(failure) if failure.retriable => {
            // 5xx so the provider redelivers.
            warn!(
                "stt webhook for task {} failed retriably: {}",
                query.task_id, failure.message
            );
            ctx.metrics.record_webhook("stt", "retry").await;
            Err(ApiError::internal(failure.message))
        }
        Err(failure) => {
            ctx.metrics.record_webhook("stt", "failed").await;
            Err(ApiError::invalid_input(failure.message))
        }
    }
}

/// Subscription events. `invoice.paid` credits minutes; `user.registered`
/// creates the zero balance row and attributes any anonymous trial usage.
#[post("/webhooks/subscription")]
pub async fn subscription_webhook(
    req: HttpRequest,
    body: web::Bytes,
    ctx: web::Data<AppContext>,
) -> Result<HttpResponse, ApiError> {
    let Some(secret) = ctx.subscription_webhook_secret.as_deref() else {
        return Err(ApiError::Unauthorized(
            "subscription webhook not configured".into(),
        ));
    };
    let signature = signature_header(&req, SUBSCRIPTION_SIGNATURE_HEADER)
        .ok_or_else(|| ApiError::Unauthorized("missing signature".into()))?;
    if !verify_signature(secret, &body, signature) {
        ctx.metrics.record_webhook("subscription", "bad_signature").await;
        return Err(ApiError::Unauthorized("invalid signature".into()));
    }

    let event: SubscriptionEvent = serde_json::from_slice(&body)
        .map_err(|_| ApiError::invalid_input("unrecognized event body"))?;

    let outcome = apply_subscription_event(&ctx, &event).await?;
    ctx.metrics.record_webhook("subscription", outcome).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "received": true, "outcome": outcome })))
}

/// Apply one subscription event. The event id is the idempotency key:
/// replays return without reprocessing.
pub async fn apply_subscription_event(
    ctx: &AppContext,
    event: &SubscriptionEvent,
) -> Result<&'static str, ApiError> {
    if !ctx.store.record_event_once(&event.id).await? {
        info!("subscription event {} already processed", event.id);
        return Ok("duplicate");
    }

    match event.event_type.as_str() {
        "invoice.paid" => {
            let minutes: i64 = event.data.lines.iter().map(|l| l.minutes).sum();
            if minutes <= 0 {
                warn!("invoice event {} carries no minutes", event.id);
                return Ok("empty");
            }
            ctx.billing.add(&event.data.user_id, minutes).await?;
            Ok("credited")
        }
        "user.registered" => {
            ctx.billing.on_user_registered(&event.data.user_id).await?;
            if let Some(anon_id) = event.data.anon_id.as_deref() {
                ctx.billing
                    .bind_trial_to_user(&event.data.user_id, anon_id)
                    .await?;
            }
            Ok("registered")
        }
        other => {
            info!("ignoring subscription event type {:?}", other);
            Ok("ignored")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::TaskAdmission;
    use crate::artifacts::{ArtifactStore, LocalArtifactStore};
    use crate::billing::BillingLedger;
    use crate::dispatcher::{DispatchError, Dispatcher, JobEnvelope};
    use crate::executor::TaskExecutor;
    use crate::metrics::{Metrics, NullExporter};
    use crate::normalize::SegmentNormalizer;
    use crate::store::{sqlite::SqliteStore, TaskPriority, TrialStore};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct DropDispatcher;

    #[async_trait]
    impl Dispatcher for DropDispatcher {
        async fn enqueue(
            &self,
            _job: JobEnvelope,
            _priority: TaskPriority,
        ) -> Result<(), DispatchError> {
            Ok(())
        }

        fn is_durable(&self) -> bool {
            false
        }
    }

    async fn context() -> (AppContext, tempfile::TempDir) {
        let store = Arc::new(SqliteStore::connect_in_memory().await.unwrap());
        let billing = BillingLedger::new(Arc::clone(&store));
        let metrics = Metrics::new(Arc::new(NullExporter));
        let artifact_dir = tempfile::tempdir().unwrap();
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(LocalArtifactStore::new(artifact_dir.path(), "http://cdn.test"));

        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&store),
            billing.clone(),
            SegmentNormalizer::new(None),
            None,
            None,
            artifacts,
            metrics.clone(),
        ));
        let admission = Arc::new(TaskAdmission::new(
            Arc::clone(&store),
            billing.clone(),
            None,
            Arc::new(DropDispatcher),
            metrics.clone(),
            30,
            5,
        ));

        (
            AppContext {
                store,
                admission,
                executor,
                billing,
                metrics,
                stt_webhook_secret: Some("secret".into()),
                subscription_webhook_secret: Some("secret".into()),
            },
            artifact_dir,
        )
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"metadata":{"duration":1.0}}"#;
        let signature = sign("secret", body);
        assert!(verify_signature("secret", body, &signature));
        assert!(!verify_signature("other", body, &signature));
        assert!(!verify_signature("secret", b"tampered", &signature));
        assert!(!verify_signature("secret", body, "not-hex"));
    }

    #[tokio::test]
    async fn invoice_paid_credits_line_item_minutes_once() {
        let (ctx, _guard) = context().await;
        let event = SubscriptionEvent {
            id: "evt_1".into(),
            event_type: "invoice.paid".into(),
            data: SubscriptionData {
                user_id: "u1".into(),
                anon_id: None,
                lines: vec![InvoiceLine { minutes: 100 }, InvoiceLine { minutes: 20 }],
            },
        };

        assert_eq!(apply_subscription_event(&ctx, &event).await.unwrap(), "credited");
        assert_eq!(ctx.billing.balance_minutes("u1").await.unwrap(), 120);

        // Replay: no double credit.
        assert_eq!(apply_subscription_event(&ctx, &event).await.unwrap(), "duplicate");
        assert_eq!(ctx.billing.balance_minutes("u1").await.unwrap(), 120);
    }

    #[tokio::test]
    async fn registration_creates_balance_and_binds_trial() {
        let (ctx, _guard) = context().await;
        ctx.store.ensure_anon_token("a1", None, None).await.unwrap();
        ctx.billing.record_trial(None, Some("a1")).await.unwrap();

        let event = SubscriptionEvent {
            id: "evt_2".into(),
            event_type: "user.registered".into(),
            data: SubscriptionData {
                user_id: "u1".into(),
                anon_id: Some("a1".into()),
                lines: Vec::new(),
            },
        };

        assert_eq!(
            apply_subscription_event(&ctx, &event).await.unwrap(),
            "registered"
        );
        assert_eq!(ctx.billing.balance_minutes("u1").await.unwrap(), 0);
        // The trial followed the user.
        assert!(ctx.billing.check_trial(Some("u1"), None).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_event_types_are_ignored_but_recorded() {
        let (ctx, _guard) = context().await;
        let event = SubscriptionEvent {
            id: "evt_3".into(),
            event_type: "customer.updated".into(),
            data: SubscriptionData {
                user_id: "u1".into(),
                anon_id: None,
                lines: Vec::new(),
            },
        };

        assert_eq!(apply_subscription_event(&ctx, &event).await.unwrap(), "ignored");
        // The id is burned either way.
        assert_eq!(
            apply_subscription_event(&ctx, &event).await.unwrap(),
            "duplicate"
        );
    }

    #[actix_web::test]
    async fn stt_webhook_rejects_bad_signature_without_side_effects() {
        use actix_web::{test, web, App};

        let (ctx, _guard) = context().await;
        let data = web::Data::new(ctx);
        let app = test::init_service(App::new().app_data(data.clone()).service(stt_webhook)).await;

        let body = serde_json::json!({
            "metadata": {"duration": 10.0},
            "results": {"channels": [], "utterances": [{"start": 0.0, "end": 1.0, "transcript": "x"}]}
        })
        .to_string();

        let req = test::TestRequest::post()
            .uri("/webhooks/stt?task_id=t1")
            .insert_header(("dg-signature", "deadbeef"))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn stt_webhook_finalizes_a_processing_task() {
        use actix_web::{test, web, App};
        use crate::models::TaskParams;
        use crate::store::{SourceType, TaskRecord, TaskStatus, TaskStore};
        use chrono::Utc;

        let (ctx, _guard) = context().await;
        let now = Utc::now();
        let record = TaskRecord {
            id: "t1".into(),
            user_id: Some("u1".into()),
            anon_id: None,
            source_type: SourceType::Url,
            task_type: "transcription".into(),
            is_trial: false,
            priority: TaskPriority::Paid,
            source_url: "https://cdn.example/a.mp3".into(),
            params: TaskParams::default(),
            status: TaskStatus::Pending,
            engine: None,
            duration_sec: 0.0,
            cost_minutes: 0,
            error_msg: None,
            created_at: now,
            updated_at: now,
        };
        ctx.store.insert_pending(&record).await.unwrap();
        ctx.store.claim_task("t1", false).await.unwrap();

        let data = web::Data::new(ctx);
        let app = test::init_service(App::new().app_data(data.clone()).service(stt_webhook)).await;

        let body = serde_json::json!({
            "metadata": {"duration": 30.0},
            "results": {"channels": [], "utterances": [{"start": 0.0, "end": 1.0, "transcript": "Done."}]}
        })
        .to_string();
        let signature = sign("secret", body.as_bytes());

        let req = test::TestRequest::post()
            .uri("/webhooks/stt?task_id=t1")
            .insert_header(("dg-signature", signature))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let task = data.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.cost_minutes, 1);
    }
}
