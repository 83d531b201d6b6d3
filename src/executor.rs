// Task executor
//
// Drives one task through its state machine as a linear pipeline:
// Source → Provider → Normalize → Format → Persist → Settle. State
// transitions are conditional updates, so duplicate deliveries and sweeper
// races resolve to exactly one winner. Billing runs only after this
// executor wins the terminal transition, which makes the deduction
// at-most-once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::artifacts::{transcript_key, ArtifactStore};
use crate::billing::BillingLedger;
use crate::metrics::Metrics;
use crate::models::Segment;
use crate::normalize::{NormalizeError, SegmentNormalizer};
use crate::providers::auto_transcript::{AutoTranscriptClient, TranscriptMode};
use crate::providers::stt::SttClient;
use crate::providers::{auto_transcript, stt, ProviderError, TranscriptResult};
use crate::store::{sqlite::SqliteStore, SourceType, TaskRecord, TaskStore, TranscriptRecord, TranscriptStore};
use crate::subtitle::{srt::SrtFormatter, vtt::VttFormatter, SubtitleFormatter};

/// How often a running execution bumps `updated_at` so the sweeper leaves
/// live tasks alone during long provider calls.
const HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// A failed execution attempt. Retriable failures are left for the
/// dispatcher's retry budget; fatal ones are written to the task row by the
/// executor itself.
#[derive(Debug)]
pub struct TaskFailure {
    pub retriable: bool,
    pub message: String,
}

impl TaskFailure {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            message: message.into(),
        }
    }

    fn retriable(message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            message: message.into(),
        }
    }

    fn from_provider(e: ProviderError) -> Self {
        Self {
            retriable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

struct Outcome {
    duration_sec: f64,
    cost_minutes: i64,
    engine: &'static str,
}

/// Minutes billed for a generated transcript of the given length.
pub fn cost_for_duration(duration_sec: f64) -> i64 {
    if duration_sec <= 0.0 {
        return 0;
    }
    (duration_sec / 60.0).ceil() as i64
}

/// Executes tasks end to end.
pub struct TaskExecutor {
    store: Arc<SqliteStore>,
    billing: BillingLedger,
    normalizer: SegmentNormalizer,
    auto_transcript: Option<Arc<AutoTranscriptClient>>,
    stt: Option<Arc<SttClient>>,
    artifacts: Arc<dyn ArtifactStore>,
    metrics: Metrics,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<SqliteStore>,
        billing: BillingLedger,
        normalizer: SegmentNormalizer,
        auto_transcript: Option<Arc<AutoTranscriptClient>>,
        stt: Option<Arc<SttClient>>,
        artifacts: Arc<dyn ArtifactStore>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            billing,
            normalizer,
            auto_transcript,
            stt,
            artifacts,
            metrics,
        }
    }

    /// Execute one delivery of a task job.
    ///
    /// Returns `Err` only for retriable failures; the task is then still
    /// `processing` and the dispatcher owns the retry decision. Fatal
    /// failures are recorded on the task row here.
    pub async fn execute(&self, task_id: &str, allow_resume: bool) -> Result<(), TaskFailure> {
        let Some(task) = self
            .store
            .get_task(task_id)
            .await
            .map_err(|e| TaskFailure::retriable(format!("load task: {e}")))?
        else {
            warn!("job references unknown task {}", task_id);
            return Ok(());
        };

        if task.status.is_terminal() {
            debug!("task {} already {}, skipping", task_id, task.status.as_str());
            return Ok(());
        }

        if !self
            .store
            .claim_task(task_id, allow_resume)
            .await
            .map_err(|e| TaskFailure::retriable(format!("claim task: {e}")))?
        {
            // Another worker holds it, or it went terminal in between.
            debug!("task {} not claimable, skipping", task_id);
            return Ok(());
        }

        let _heartbeat = self.spawn_heartbeat(task_id);
        let started = Utc::now();

        match self.run_pipeline(&task).await {
            Ok(outcome) => {
                self.settle_and_succeed(&task, &outcome).await?;
                let elapsed = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
                self.metrics
                    .record_task_completed(outcome.engine, "succeeded", elapsed)
                    .await;
                info!(
                    "task {} succeeded ({}s media, {} minutes billed)",
                    task_id, outcome.duration_sec, outcome.cost_minutes
                );
                Ok(())
            }
            Err(failure) if failure.retriable => {
                warn!("task {} attempt failed (retriable): {}", task_id, failure.message);
                Err(failure)
            }
            Err(failure) => {
                error!("task {} failed: {}", task_id, failure.message);
                self.mark_failed(task_id, &failure.message).await;
                Ok(())
            }
        }
    }

    /// Finalize a task from an STT webhook delivery carrying the full
    /// provider payload. Idempotent: terminal tasks are left untouched.
    pub async fn finalize_from_webhook(
        &self,
        task_id: &str,
        result: TranscriptResult,
    ) -> Result<(), TaskFailure> {
        let Some(task) = self
            .store
            .get_task(task_id)
            .await
            .map_err(|e| TaskFailure::retriable(format!("load task: {e}")))?
        else {
            return Err(TaskFailure::fatal(format!("unknown task {task_id}")));
        };

        if task.status.is_terminal() {
            debug!("webhook for terminal task {}, ignoring", task_id);
            return Ok(());
        }

        self.store
            .claim_task(task_id, true)
            .await
            .map_err(|e| TaskFailure::retriable(format!("claim task: {e}")))?;

        match self.complete_with_result(&task, result, stt::ENGINE, false).await {
            Ok(outcome) => {
                self.settle_and_succeed(&task, &outcome).await?;
                self.metrics
                    .record_task_completed(outcome.engine, "succeeded", 0.0)
                    .await;
                Ok(())
            }
            Err(failure) if failure.retriable => Err(failure),
            Err(failure) => {
                self.mark_failed(task_id, &failure.message).await;
                Ok(())
            }
        }
    }

    async fn run_pipeline(&self, task: &TaskRecord) -> Result<Outcome, TaskFailure> {
        match task.source_type {
            SourceType::Youtube => self.run_auto_transcript(task).await,
            SourceType::Upload | SourceType::Url => self.run_stt(task).await,
        }
    }

    /// Auto-captioned platform URLs go to the auto-transcript provider, in
    /// auto mode: native captions when they exist, async generation when
    /// they do not. Only the generated path is billed.
    async fn run_auto_transcript(&self, task: &TaskRecord) -> Result<Outcome, TaskFailure> {
        let client = self
            .auto_transcript
            .as_ref()
            .ok_or_else(|| TaskFailure::fatal("no auto-transcript provider configured"))?;

        self.store
            .set_engine(&task.id, auto_transcript::ENGINE)
            .await
            .map_err(|e| TaskFailure::retriable(format!("set engine: {e}")))?;

        let language = task.params.language.as_deref();
        let fetched = client
            .fetch(&task.source_url, TranscriptMode::Auto, language)
            .await;

        self.metrics
            .record_provider_request(
                auto_transcript::ENGINE,
                if fetched.is_ok() { "ok" } else { "error" },
            )
            .await;

        let result = fetched
            .map_err(TaskFailure::from_provider)?
            .ok_or_else(|| TaskFailure::fatal("provider returned no transcript"))?;

        // Generated transcripts get the LLM-assisted merge when available;
        // native captions only need the rule-based pass.
        let llm_assist = result.is_generated;
        self.complete_with_result(task, result, auto_transcript::ENGINE, llm_assist)
            .await
    }

    /// Uploaded media and direct URLs go to the sync STT provider with
    /// diarization; its work is always billable.
    async fn run_stt(&self, task: &TaskRecord) -> Result<Outcome, TaskFailure> {
        let client = self
            .stt
            .as_ref()
            .ok_or_else(|| TaskFailure::fatal("no STT provider configured"))?;

        self.store
            .set_engine(&task.id, stt::ENGINE)
            .await
            .map_err(|e| TaskFailure::retriable(format!("set engine: {e}")))?;

        let language = task.params.language.as_deref();
        let detect_language = task.params.detect_language.unwrap_or(true);
        let transcribed = client
            .transcribe_url(&task.source_url, language, detect_language)
            .await;

        self.metrics
            .record_provider_request(stt::ENGINE, if transcribed.is_ok() { "ok" } else { "error" })
            .await;

        let result = transcribed.map_err(TaskFailure::from_provider)?;
        self.complete_with_result(task, result, stt::ENGINE, false).await
    }

    /// Shared tail of the pipeline: normalize, optionally translate, format
    /// subtitles, store artifacts and upsert the transcript row. The upsert
    /// keyed on task id makes a retried attempt idempotent.
    async fn complete_with_result(
        &self,
        task: &TaskRecord,
        result: TranscriptResult,
        engine: &'static str,
        llm_assist: bool,
    ) -> Result<Outcome, TaskFailure> {
        let cost_minutes = if result.is_generated {
            cost_for_duration(result.duration_sec)
        } else {
            0
        };

        let mut segments = self.normalizer.merge(&result.chunks, llm_assist).await;

        // Translation only applies to STT sources with an explicit target
        // language; it has no fallback, so its failure fails the task.
        let wants_translation = matches!(task.source_type, SourceType::Upload | SourceType::Url)
            && task.params.language.is_some()
            && self.normalizer.llm_available();
        if wants_translation {
            let target = task.params.language.as_deref().unwrap_or_default();
            segments = match self.normalizer.translate(&segments, target).await {
                Ok(translated) => translated,
                Err(NormalizeError::TranslateUnavailable) => segments,
                Err(e) => return Err(TaskFailure::fatal(e.to_string())),
            };
        }

        let artifact_urls = self.store_artifacts(&task.id, &segments, &result.raw).await?;

        let record = TranscriptRecord {
            task_id: task.id.clone(),
            segments,
            raw_payload: result.raw,
            srt_url: artifact_urls.0,
            vtt_url: artifact_urls.1,
            raw_url: artifact_urls.2,
            created_at: Utc::now(),
        };
        self.store
            .upsert_transcript(&record)
            .await
            .map_err(|e| TaskFailure::retriable(format!("persist transcript: {e}")))?;

        Ok(Outcome {
            duration_sec: result.duration_sec,
            cost_minutes,
            engine,
        })
    }

    async fn store_artifacts(
        &self,
        task_id: &str,
        segments: &[Segment],
        raw: &serde_json::Value,
    ) -> Result<(Option<String>, Option<String>, Option<String>), TaskFailure> {
        let srt = SrtFormatter.format(segments);
        let vtt = VttFormatter.format(segments);

        let srt_url = self
            .artifacts
            .put(
                &transcript_key(task_id, "output.srt"),
                srt.as_bytes(),
                SrtFormatter.content_type(),
            )
            .await
            .map_err(|e| TaskFailure::retriable(format!("store srt: {e}")))?;
        let vtt_url = self
            .artifacts
            .put(
                &transcript_key(task_id, "output.vtt"),
                vtt.as_bytes(),
                VttFormatter.content_type(),
            )
            .await
            .map_err(|e| TaskFailure::retriable(format!("store vtt: {e}")))?;
        let raw_url = self
            .artifacts
            .put(
                &transcript_key(task_id, "raw.json"),
                raw.to_string().as_bytes(),
                "application/json",
            )
            .await
            .map_err(|e| TaskFailure::retriable(format!("store raw payload: {e}")))?;

        Ok((Some(srt_url), Some(vtt_url), Some(raw_url)))
    }

    /// Win the terminal transition, then settle. Settlement failures never
    /// roll the task back: the work is done and refusing to return it helps
    /// no one. They are logged with enough context to repair manually.
    async fn settle_and_succeed(&self, task: &TaskRecord, outcome: &Outcome) -> Result<(), TaskFailure> {
        let won = self
            .store
            .finish_succeeded(&task.id, outcome.duration_sec, outcome.cost_minutes)
            .await
            .map_err(|e| TaskFailure::retriable(format!("finish task: {e}")))?;

        if !won {
            // Swept as stuck, or another delivery finished first. The other
            // writer owns settlement.
            warn!("task {} lost its terminal transition, skipping settlement", task.id);
            return Ok(());
        }

        if task.is_trial {
            if let Err(e) = self
                .billing
                .record_trial(task.user_id.as_deref(), task.anon_id.as_deref())
                .await
            {
                error!(
                    "task {}: trial usage not recorded (user: {:?}, anon: {:?}): {}",
                    task.id, task.user_id, task.anon_id, e
                );
            }
        } else if let Some(user_id) = task.user_id.as_deref() {
            if outcome.cost_minutes > 0 {
                match self.billing.deduct(user_id, outcome.cost_minutes).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        "task {}: user {} balance short of {} minutes; work delivered anyway",
                        task.id, user_id, outcome.cost_minutes
                    ),
                    Err(e) => error!(
                        "task {}: deduction of {} minutes for {} errored: {}",
                        task.id, outcome.cost_minutes, user_id, e
                    ),
                }
            }
        }

        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, message: &str) {
        match self.store.finish_failed(task_id, message).await {
            Ok(true) => {
                self.metrics.record_task_completed("unknown", "failed", 0.0).await;
            }
            Ok(false) => warn!("task {} was already terminal when marking failed", task_id),
            Err(e) => error!("task {}: could not record failure: {}", task_id, e),
        }
    }

    /// Keep `updated_at` fresh while the pipeline runs so the sweeper does
    /// not mistake a long provider call for a crashed worker.
    fn spawn_heartbeat(&self, task_id: &str) -> HeartbeatGuard {
        let store = Arc::clone(&self.store);
        let task_id = task_id.to_string();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                match store.touch_processing(&task_id).await {
                    Ok(true) => {}
                    Ok(false) => break, // task left `processing`
                    Err(e) => {
                        debug!("heartbeat for task {} failed: {}", task_id, e);
                    }
                }
            }
        });
        HeartbeatGuard { handle }
    }
}

struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::LocalArtifactStore;
    use crate::metrics::{Metrics, NullExporter};
    use crate::models::TaskParams;
    use crate::store::{BalanceStore, TaskPriority, TaskStatus, TrialStore};
    use serde_json::json;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        store: Arc<SqliteStore>,
        executor: TaskExecutor,
        _artifact_dir: tempfile::TempDir,
    }

    async fn harness(auto_url: Option<String>, stt_url: Option<String>) -> Harness {
        let store = Arc::new(SqliteStore::connect_in_memory().await.unwrap());
        let billing = BillingLedger::new(Arc::clone(&store));
        let artifact_dir = tempfile::tempdir().unwrap();
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(
            artifact_dir.path(),
            "http://cdn.test",
        ));

        let auto = auto_url.map(|url| {
            Arc::new(
                AutoTranscriptClient::new(url, "k".into())
                    .with_polling(StdDuration::from_millis(5), 5),
            )
        });
        let stt = stt_url.map(|url| Arc::new(SttClient::new(url, "k".into(), "nova-2".into())));

        let executor = TaskExecutor::new(
            Arc::clone(&store),
            billing,
            SegmentNormalizer::new(None),
            auto,
            stt,
            artifacts,
            Metrics::new(Arc::new(NullExporter)),
        );

        Harness {
            store,
            executor,
            _artifact_dir: artifact_dir,
        }
    }

    async fn insert_task(
        store: &SqliteStore,
        id: &str,
        source_type: SourceType,
        user_id: Option<&str>,
        anon_id: Option<&str>,
        is_trial: bool,
    ) {
        let now = Utc::now();
        let record = TaskRecord {
            id: id.to_string(),
            user_id: user_id.map(String::from),
            anon_id: anon_id.map(String::from),
            source_type,
            task_type: "transcription".into(),
            is_trial,
            priority: TaskPriority::Free,
            source_url: match source_type {
                SourceType::Youtube => "https://youtu.be/abc".into(),
                _ => "https://cdn.test/media.mp3".into(),
            },
            params: TaskParams::default(),
            status: TaskStatus::Pending,
            engine: None,
            duration_sec: 0.0,
            cost_minutes: 0,
            error_msg: None,
            created_at: now,
            updated_at: now,
        };
        assert!(store.insert_pending(&record).await.unwrap());
    }

    #[test]
    fn cost_rounds_up_to_whole_minutes() {
        assert_eq!(cost_for_duration(0.0), 0);
        assert_eq!(cost_for_duration(1.0), 1);
        assert_eq!(cost_for_duration(60.0), 1);
        assert_eq!(cost_for_duration(60.1), 2);
        assert_eq!(cost_for_duration(-5.0), 0);
    }

    #[tokio::test]
    async fn native_caption_path_costs_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transcript"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"text": "hello", "offset": 0, "duration": 2000}],
                "lang": "en"
            })))
            .mount(&server)
            .await;

        let h = harness(Some(server.uri()), None).await;
        h.store.add_minutes("u1", 10).await.unwrap();
        insert_task(&h.store, "t1", SourceType::Youtube, Some("u1"), None, false).await;

        h.executor.execute("t1", false).await.unwrap();

        let task = h.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.cost_minutes, 0);
        assert_eq!(task.engine.as_deref(), Some("auto_transcript"));

        // No deduction for native captions.
        assert_eq!(
            h.store.get_balance("u1").await.unwrap().unwrap().minutes_balance,
            10
        );

        let transcript = h.store.get_transcript("t1").await.unwrap().unwrap();
        assert_eq!(transcript.segments.len(), 1);
        assert!(transcript.srt_url.unwrap().contains("transcripts/t1/output.srt"));
    }

    #[tokio::test]
    async fn generated_path_bills_ceil_minutes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transcript"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"jobId": "j1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/transcript/j1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "active"})))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/transcript/j1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"text": "a", "offset": 0, "duration": 1000}],
                "lang": "en"
            })))
            .mount(&server)
            .await;

        let h = harness(Some(server.uri()), None).await;
        h.store.add_minutes("u1", 10).await.unwrap();
        insert_task(&h.store, "t1", SourceType::Youtube, Some("u1"), None, false).await;

        h.executor.execute("t1", false).await.unwrap();

        let task = h.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.cost_minutes, 1);
        assert_eq!(task.duration_sec, 1.0);

        assert_eq!(
            h.store.get_balance("u1").await.unwrap().unwrap().minutes_balance,
            9
        );
    }

    #[tokio::test]
    async fn trial_task_records_usage_instead_of_billing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transcript"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"text": "hi", "offset": 0, "duration": 1000}],
                "lang": "en"
            })))
            .mount(&server)
            .await;

        let h = harness(Some(server.uri()), None).await;
        h.store.ensure_anon_token("a1", None, None).await.unwrap();
        insert_task(&h.store, "t1", SourceType::Youtube, None, Some("a1"), true).await;

        h.executor.execute("t1", false).await.unwrap();

        let task = h.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(h.store.has_used_trial(None, Some("a1")).await.unwrap());
    }

    #[tokio::test]
    async fn stt_path_prefers_utterances_and_bills() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/listen"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {"duration": 61.0},
                "results": {
                    "channels": [],
                    "utterances": [
                        {"start": 0.0, "end": 2.0, "transcript": "Hello there.", "speaker": 0}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let h = harness(None, Some(server.uri())).await;
        h.store.add_minutes("u1", 5).await.unwrap();
        insert_task(&h.store, "t1", SourceType::Url, Some("u1"), None, false).await;

        h.executor.execute("t1", false).await.unwrap();

        let task = h.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.engine.as_deref(), Some("stt"));
        assert_eq!(task.cost_minutes, 2); // ceil(61/60)
        assert_eq!(
            h.store.get_balance("u1").await.unwrap().unwrap().minutes_balance,
            3
        );
    }

    #[tokio::test]
    async fn client_error_fails_the_task() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transcript"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad url"))
            .mount(&server)
            .await;

        let h = harness(Some(server.uri()), None).await;
        insert_task(&h.store, "t1", SourceType::Youtube, Some("u1"), None, false).await;

        h.executor.execute("t1", false).await.unwrap();

        let task = h.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_msg.unwrap().contains("400"));
    }

    #[tokio::test]
    async fn server_error_is_left_for_the_dispatcher() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transcript"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let h = harness(Some(server.uri()), None).await;
        insert_task(&h.store, "t1", SourceType::Youtube, Some("u1"), None, false).await;

        let failure = h.executor.execute("t1", false).await.unwrap_err();
        assert!(failure.retriable);

        // Task stays processing so a resumed attempt can pick it up.
        let task = h.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);

        // The retry resumes and can still fail fatally later.
        let second = h.executor.execute("t1", true).await.unwrap_err();
        assert!(second.retriable);
    }

    #[tokio::test]
    async fn duplicate_delivery_aborts_silently() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transcript"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"text": "hi", "offset": 0, "duration": 500}],
                "lang": "en"
            })))
            .mount(&server)
            .await;

        let h = harness(Some(server.uri()), None).await;
        insert_task(&h.store, "t1", SourceType::Youtube, Some("u1"), None, false).await;

        h.executor.execute("t1", false).await.unwrap();
        // Second delivery of the same job: status is terminal, nothing runs.
        h.executor.execute("t1", false).await.unwrap();

        let task = h.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn webhook_finalization_is_idempotent() {
        let h = harness(None, None).await;
        h.store.add_minutes("u1", 10).await.unwrap();
        insert_task(&h.store, "t1", SourceType::Url, Some("u1"), None, false).await;
        h.store.claim_task("t1", false).await.unwrap();

        let payload = crate::providers::stt::parse_payload(json!({
            "metadata": {"duration": 120.0},
            "results": {
                "channels": [],
                "utterances": [{"start": 0.0, "end": 3.0, "transcript": "Done."}]
            }
        }))
        .unwrap();

        h.executor
            .finalize_from_webhook("t1", payload.clone())
            .await
            .unwrap();
        let task = h.store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.cost_minutes, 2);
        assert_eq!(
            h.store.get_balance("u1").await.unwrap().unwrap().minutes_balance,
            8
        );

        // Redelivery changes nothing.
        h.executor.finalize_from_webhook("t1", payload).await.unwrap();
        assert_eq!(
            h.store.get_balance("u1").await.unwrap().unwrap().minutes_balance,
            8
        );
    }
}
