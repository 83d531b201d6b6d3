// Task admission
//
// Validates an incoming request against identity, trial, balance and
// concurrency gates, persists the pending task and hands it to the
// dispatcher. Every gate fails closed. Identity arrives as an explicit
// [`Caller`]; nothing here inspects ambient request state.

use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::billing::BillingLedger;
use crate::dispatcher::{Dispatcher, JobEnvelope};
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::models::{Caller, CreateTaskRequest, CreateTaskResponse};
use crate::providers::metadata::{extract_video_id, MetadataClient};
use crate::store::{sqlite::SqliteStore, SourceType, TaskPriority, TaskRecord, TaskStatus, TaskStore};

/// Admission gateway for new tasks.
pub struct TaskAdmission {
    store: Arc<SqliteStore>,
    billing: BillingLedger,
    metadata: Option<Arc<MetadataClient>>,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Metrics,
    trial_max_duration_minutes: u64,
    retry_after_seconds: u64,
}

impl TaskAdmission {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteStore>,
        billing: BillingLedger,
        metadata: Option<Arc<MetadataClient>>,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Metrics,
        trial_max_duration_minutes: u64,
        retry_after_seconds: u64,
    ) -> Self {
        Self {
            store,
            billing,
            metadata,
            dispatcher,
            metrics,
            trial_max_duration_minutes,
            retry_after_seconds,
        }
    }

    /// Admit one task. On success the task is persisted in `pending` and a
    /// job is enqueued; the caller polls `GET /tasks/{id}` after
    /// `retry_after` seconds.
    pub async fn create_task(
        &self,
        request: CreateTaskRequest,
        caller: &Caller,
    ) -> Result<CreateTaskResponse, ApiError> {
        validate_source_url(&request.source_url)?;

        // An explicit trial wins over authentication: authenticated callers
        // may still choose to burn their trial.
        let effective_trial = request.is_trial.unwrap_or(false) || !caller.authenticated;

        if !caller.authenticated && caller.anon_id.is_none() {
            return Err(ApiError::Unauthorized(
                "anonymous requests must carry an anon id".into(),
            ));
        }

        if effective_trial {
            self.check_trial_gates(&request, caller).await?;
        } else {
            self.check_balance_gate(caller).await?;
        }

        let priority = if caller.authenticated && !effective_trial {
            TaskPriority::Paid
        } else {
            TaskPriority::Free
        };

        // Fast-path conflict check; the conditional insert below stays the
        // authoritative serialization point for racing admissions.
        if self
            .store
            .has_active_task(caller.user_id.as_deref(), caller.anon_id.as_deref())
            .await?
        {
            return Err(ApiError::Conflict("a task is already in flight".into()));
        }

        let now = Utc::now();
        let record = TaskRecord {
            id: Uuid::new_v4().to_string(),
            user_id: caller.user_id.clone(),
            anon_id: caller.anon_id.clone(),
            source_type: request.source_type,
            task_type: "transcription".into(),
            is_trial: effective_trial,
            priority,
            source_url: request.source_url.clone(),
            params: request.params.unwrap_or_default(),
            status: TaskStatus::Pending,
            engine: None,
            duration_sec: 0.0,
            cost_minutes: 0,
            error_msg: None,
            created_at: now,
            updated_at: now,
        };

        if !self.store.insert_pending(&record).await? {
            return Err(ApiError::Conflict("a task is already in flight".into()));
        }

        if let Err(e) = self
            .dispatcher
            .enqueue(JobEnvelope::for_task(&record), priority)
            .await
        {
            error!("task {} admitted but not enqueued: {}", record.id, e);
            // Release the admission slot; the caller can retry cleanly.
            if !self.store.finish_failed(&record.id, "dispatch failed").await? {
                warn!("task {} could not be failed after dispatch error", record.id);
            }
            return Err(ApiError::internal("task could not be dispatched"));
        }

        self.metrics
            .record_task_submitted(record.source_type.as_str(), priority.as_str())
            .await;
        info!(
            "task {} admitted ({}, {}, trial: {})",
            record.id,
            record.source_type.as_str(),
            priority.as_str(),
            record.is_trial
        );

        Ok(CreateTaskResponse {
            task_id: record.id,
            status: TaskStatus::Pending,
            retry_after: self.retry_after_seconds,
        })
    }

    async fn check_trial_gates(
        &self,
        request: &CreateTaskRequest,
        caller: &Caller,
    ) -> Result<(), ApiError> {
        if let Some(anon_id) = caller.anon_id.as_deref() {
            self.billing
                .ensure_anon_token(anon_id, caller.ip_hash.as_deref(), caller.ua_hash.as_deref())
                .await?;
        }

        if self
            .billing
            .check_trial(caller.user_id.as_deref(), caller.anon_id.as_deref())
            .await?
        {
            return Err(ApiError::TrialExhausted);
        }

        // Trials are bounded by media duration, which is only knowable for
        // platform videos. The lookup is best-effort and fails closed:
        // nothing is admitted optimistically.
        if request.source_type == SourceType::Youtube {
            let video_id = extract_video_id(&request.source_url)
                .ok_or_else(|| ApiError::invalid_input("unrecognized video url"))?;

            let metadata = self
                .metadata
                .as_ref()
                .ok_or_else(|| ApiError::invalid_input("video metadata lookup unavailable"))?;

            let resolved = metadata.resolve(&video_id).await.map_err(|e| {
                warn!("metadata lookup for {} failed: {}", video_id, e);
                ApiError::invalid_input("video metadata lookup failed")
            })?;

            let cap_seconds = self.trial_max_duration_minutes * 60;
            if resolved.duration_seconds > cap_seconds {
                return Err(ApiError::DurationExceeded {
                    limit_minutes: self.trial_max_duration_minutes,
                });
            }
        }

        Ok(())
    }

    async fn check_balance_gate(&self, caller: &Caller) -> Result<(), ApiError> {
        let user_id = caller
            .user_id
            .as_deref()
            .ok_or_else(|| ApiError::Unauthorized("authenticated caller without user id".into()))?;

        // The final cost is unknown at admission; any positive balance
        // qualifies. Settlement handles the rest.
        if self.billing.balance_minutes(user_id).await? <= 0 {
            return Err(ApiError::InsufficientBalance);
        }
        Ok(())
    }
}

fn validate_source_url(source_url: &str) -> Result<(), ApiError> {
    let url = Url::parse(source_url)
        .map_err(|_| ApiError::invalid_input("source_url is not a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::invalid_input("source_url must be http or https"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchError;
    use crate::metrics::NullExporter;
    use crate::store::{BalanceStore, TrialStore};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubDispatcher {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Dispatcher for StubDispatcher {
        async fn enqueue(
            &self,
            job: JobEnvelope,
            _priority: TaskPriority,
        ) -> Result<(), DispatchError> {
            self.seen.lock().await.push(job.task_id);
            Ok(())
        }

        fn is_durable(&self) -> bool {
            false
        }
    }

    async fn admission(metadata_url: Option<String>) -> (TaskAdmission, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::connect_in_memory().await.unwrap());
        let billing = BillingLedger::new(Arc::clone(&store));
        let metadata = metadata_url.map(|url| Arc::new(MetadataClient::new(url, "k".into())));
        let admission = TaskAdmission::new(
            Arc::clone(&store),
            billing,
            metadata,
            Arc::new(StubDispatcher {
                seen: Mutex::new(Vec::new()),
            }),
            Metrics::new(Arc::new(NullExporter)),
            30,
            5,
        );
        (admission, store)
    }

    fn youtube_request() -> CreateTaskRequest {
        CreateTaskRequest {
            source_type: SourceType::Youtube,
            source_url: "https://youtu.be/abc123".into(),
            size_bytes: None,
            is_trial: None,
            params: None,
        }
    }

    fn url_request() -> CreateTaskRequest {
        CreateTaskRequest {
            source_type: SourceType::Url,
            source_url: "https://cdn.example/media.mp3".into(),
            size_bytes: None,
            is_trial: None,
            params: None,
        }
    }

    fn anon_caller(anon_id: &str) -> Caller {
        Caller {
            user_id: None,
            anon_id: Some(anon_id.to_string()),
            authenticated: false,
            ip_hash: Some("ip".into()),
            ua_hash: Some("ua".into()),
        }
    }

    fn user_caller(user_id: &str) -> Caller {
        Caller {
            user_id: Some(user_id.to_string()),
            anon_id: None,
            authenticated: true,
            ip_hash: None,
            ua_hash: None,
        }
    }

    async fn metadata_server(duration_seconds: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/video"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "duration_seconds": duration_seconds,
                "title": "clip"
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn anonymous_without_anon_id_is_unauthorized() {
        let (admission, _) = admission(None).await;
        let err = admission
            .create_task(url_request(), &Caller::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn malformed_url_is_rejected() {
        let (admission, _) = admission(None).await;
        let mut request = url_request();
        request.source_url = "not a url".into();
        let err = admission
            .create_task(request, &user_caller("u1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn trial_admits_once_then_exhausts() {
        let server = metadata_server(600).await;
        let (admission, store) = admission(Some(server.uri())).await;

        let response = admission
            .create_task(youtube_request(), &anon_caller("a1"))
            .await
            .unwrap();
        assert_eq!(response.status, TaskStatus::Pending);
        assert_eq!(response.retry_after, 5);

        // Trial consumption is recorded at settlement; simulate it.
        store.mark_trial_used("a1").await.unwrap();
        // Clear the active task so only the trial gate can reject.
        store.claim_task(&response.task_id, false).await.unwrap();
        store.finish_failed(&response.task_id, "x").await.unwrap();

        let err = admission
            .create_task(youtube_request(), &anon_caller("a1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRIAL_EXHAUSTED");
    }

    #[tokio::test]
    async fn trial_duration_cap_applies_to_youtube() {
        let server = metadata_server(31 * 60).await;
        let (admission, _) = admission(Some(server.uri())).await;

        let err = admission
            .create_task(youtube_request(), &anon_caller("a1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DURATION_EXCEEDED");
    }

    #[tokio::test]
    async fn metadata_lookup_failure_fails_closed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/video"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (admission, _) = admission(Some(server.uri())).await;

        let err = admission
            .create_task(youtube_request(), &anon_caller("a1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn paid_request_requires_positive_balance() {
        let (admission, store) = admission(None).await;

        let err = admission
            .create_task(url_request(), &user_caller("u1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");

        store.add_minutes("u1", 1).await.unwrap();
        let response = admission
            .create_task(url_request(), &user_caller("u1"))
            .await
            .unwrap();

        let task = store.get_task(&response.task_id).await.unwrap().unwrap();
        assert_eq!(task.priority, TaskPriority::Paid);
        assert!(!task.is_trial);
    }

    #[tokio::test]
    async fn explicit_trial_skips_balance_and_runs_free() {
        let (admission, store) = admission(None).await;
        let mut request = url_request();
        request.is_trial = Some(true);

        // Zero balance, but an unused trial: admitted at free priority.
        let response = admission
            .create_task(request, &user_caller("u1"))
            .await
            .unwrap();
        let task = store.get_task(&response.task_id).await.unwrap().unwrap();
        assert!(task.is_trial);
        assert_eq!(task.priority, TaskPriority::Free);
    }

    #[tokio::test]
    async fn concurrent_admissions_admit_exactly_one() {
        let (admission, _) = admission(None).await;
        let mut request = url_request();
        request.is_trial = Some(true);
        let caller = anon_caller("a1");

        let mut second = url_request();
        second.is_trial = Some(true);

        let (a, b) = tokio::join!(
            admission.create_task(request, &caller),
            admission.create_task(second, &caller)
        );

        let ok_count = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(ok_count, 1);
        let err = if a.is_err() {
            a.unwrap_err()
        } else {
            b.unwrap_err()
        };
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn second_sequential_admission_conflicts() {
        let (admission, _) = admission(None).await;
        let mut request = url_request();
        request.is_trial = Some(true);

        admission
            .create_task(request.clone(), &anon_caller("a1"))
            .await
            .unwrap();
        let err = admission
            .create_task(request, &anon_caller("a1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }
}
