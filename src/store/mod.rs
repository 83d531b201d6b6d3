// Storage gateway for the Scribe API
//
// Entity records and the store traits the rest of the system is written
// against. The default implementation is [`sqlite::SqliteStore`]; to swap to
// another database, implement these traits for a new type and change the
// concrete type wired up in `main`. All trait methods use `impl Future`
// signatures so no extra async-trait crate is needed at this seam.

pub mod sqlite;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Segment, TaskParams};

/// Task lifecycle states. Transitions only move forward:
/// `pending → processing → {succeeded, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// How the source URL of a task is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Media uploaded to the object store beforehand.
    Upload,
    /// Direct media URL.
    Url,
    /// Auto-captioned platform URL.
    Youtube,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Upload => "upload",
            SourceType::Url => "url",
            SourceType::Youtube => "youtube",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(SourceType::Upload),
            "url" => Some(SourceType::Url),
            "youtube" => Some(SourceType::Youtube),
            _ => None,
        }
    }
}

/// Scheduling priority. Paid jobs are dequeued before free ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Paid,
    Free,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Paid => "paid",
            TaskPriority::Free => "free",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paid" => Some(TaskPriority::Paid),
            "free" => Some(TaskPriority::Free),
            _ => None,
        }
    }

    /// Numeric queue level; smaller is more urgent.
    pub fn queue_level(&self) -> i64 {
        match self {
            TaskPriority::Paid => 0,
            TaskPriority::Free => 1,
        }
    }
}

/// A row in the `tasks` table.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    /// Exactly one of `user_id`/`anon_id` identifies the owner; authenticated
    /// trials carry both.
    pub user_id: Option<String>,
    pub anon_id: Option<String>,
    pub source_type: SourceType,
    pub task_type: String,
    pub is_trial: bool,
    pub priority: TaskPriority,
    pub source_url: String,
    pub params: TaskParams,
    pub status: TaskStatus,
    /// Provider family that handled the task, set when routing.
    pub engine: Option<String>,
    pub duration_sec: f64,
    pub cost_minutes: i64,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row in the `transcripts` table, 1:1 with a succeeded task.
#[derive(Debug, Clone)]
pub struct TranscriptRecord {
    pub task_id: String,
    pub segments: Vec<Segment>,
    /// Original provider payload, kept verbatim for re-processing.
    pub raw_payload: serde_json::Value,
    pub srt_url: Option<String>,
    pub vtt_url: Option<String>,
    pub raw_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A row in the `balances` table. One row per user, created with zero.
#[derive(Debug, Clone)]
pub struct BalanceRecord {
    pub user_id: String,
    pub minutes_balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// A row in the `anon_tokens` table. `used_trial` only ever flips false→true.
#[derive(Debug, Clone)]
pub struct AnonTokenRecord {
    pub anon_id: String,
    pub ip_hash: Option<String>,
    pub ua_hash: Option<String>,
    pub used_trial: bool,
}

/// A row in the durable dispatcher queue.
#[derive(Debug, Clone)]
pub struct QueueJobRecord {
    pub id: i64,
    pub task_id: String,
    pub priority: i64,
    pub payload: String,
    pub attempts: i64,
    pub next_run_at: DateTime<Utc>,
}

/// Task persistence and the conditional state transitions that serialize the
/// lifecycle.
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new `pending` task unless the owner already has one in
    /// flight. Returns false when the concurrency gate rejected the insert.
    fn insert_pending(
        &self,
        record: &TaskRecord,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    fn get_task(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<TaskRecord>, sqlx::Error>> + Send;

    /// True when the owner has a task in `pending` or `processing`.
    fn has_active_task(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Tasks of one owner, newest first, filtered and cursor-paginated by
    /// `created_at`.
    fn list_tasks(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
        status: Option<TaskStatus>,
        cursor: Option<DateTime<Utc>>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<TaskRecord>, sqlx::Error>> + Send;

    /// Conditional `pending → processing` transition. With `allow_resume`
    /// a task already in `processing` is re-claimed (retry attempts).
    /// Returns false when the transition did not apply.
    fn claim_task(
        &self,
        id: &str,
        allow_resume: bool,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Record the provider family once routing is decided.
    fn set_engine(
        &self,
        id: &str,
        engine: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Advance `updated_at` on a live `processing` task so the sweeper
    /// leaves it alone during long provider calls.
    fn touch_processing(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Conditional `processing → succeeded`, writing the outputs.
    fn finish_succeeded(
        &self,
        id: &str,
        duration_sec: f64,
        cost_minutes: i64,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Conditional `{pending, processing} → failed` with an error message.
    fn finish_failed(
        &self,
        id: &str,
        error_msg: &str,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Fail every task stuck in `processing` since before `cutoff`.
    /// Returns the number of rows marked.
    fn sweep_stuck(
        &self,
        cutoff: DateTime<Utc>,
        error_msg: &str,
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;

    /// All `pending` tasks, used by startup recovery.
    fn pending_tasks(&self) -> impl Future<Output = Result<Vec<TaskRecord>, sqlx::Error>> + Send;
}

/// Transcript persistence. Upsert keyed on task id makes retried attempts
/// idempotent.
pub trait TranscriptStore: Send + Sync + 'static {
    fn upsert_transcript(
        &self,
        record: &TranscriptRecord,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn get_transcript(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<Option<TranscriptRecord>, sqlx::Error>> + Send;
}

/// Minutes balances with the conditional update that keeps them non-negative.
pub trait BalanceStore: Send + Sync + 'static {
    /// Create the zero-balance row if missing.
    fn ensure_balance(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn get_balance(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<BalanceRecord>, sqlx::Error>> + Send;

    /// Insert-or-increment.
    fn add_minutes(
        &self,
        user_id: &str,
        minutes: i64,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Conditional decrement guarded by `minutes_balance >= minutes`.
    /// Returns false without mutating when the guard fails.
    fn deduct_minutes(
        &self,
        user_id: &str,
        minutes: i64,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}

/// Trial accounting: anon tokens and the append-only usage audit.
pub trait TrialStore: Send + Sync + 'static {
    fn ensure_anon_token(
        &self,
        anon_id: &str,
        ip_hash: Option<&str>,
        ua_hash: Option<&str>,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn get_anon_token(
        &self,
        anon_id: &str,
    ) -> impl Future<Output = Result<Option<AnonTokenRecord>, sqlx::Error>> + Send;

    /// Flip `used_trial` to true, creating the token row if needed.
    fn mark_trial_used(
        &self,
        anon_id: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn append_trial_usage(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// True iff a usage row exists for the user, or the anon token has
    /// `used_trial` set.
    fn has_used_trial(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Attribute prior anonymous usage rows to a newly signed-up user.
    fn bind_trials_to_user(
        &self,
        user_id: &str,
        anon_id: &str,
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
}

/// Durable dispatcher queue.
pub trait QueueStore: Send + Sync + 'static {
    fn enqueue_job(
        &self,
        task_id: &str,
        priority: i64,
        payload: &str,
        next_run_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Claim the most urgent due job, if any. Claiming is a conditional
    /// update, so concurrent workers never hold the same job.
    fn claim_due_job(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<QueueJobRecord>, sqlx::Error>> + Send;

    fn complete_job(&self, id: i64) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Release the claim and schedule the next attempt.
    fn retry_job(
        &self,
        id: i64,
        attempts: i64,
        next_run_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Release claims older than `cutoff` (crashed workers).
    fn release_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;

    fn task_has_job(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    fn queue_depth(&self) -> impl Future<Output = Result<i64, sqlx::Error>> + Send;
}

/// Idempotency ledger for externally delivered events.
pub trait EventStore: Send + Sync + 'static {
    /// Record the event id; returns false when it was already recorded.
    fn record_event_once(
        &self,
        event_id: &str,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}
