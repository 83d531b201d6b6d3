// Scribe API data models
//
// This module contains the data models shared across the API surface:
// the caller identity passed explicitly through admission and access
// checks, subtitle segments, and the request/response types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::{SourceType, TaskRecord, TaskStatus, TranscriptRecord};

/// Identity of the caller, resolved by the HTTP glue and passed explicitly
/// through admission and access checks. The core never inspects ambient
/// request state.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// Authenticated user id, when present.
    pub user_id: Option<String>,
    /// Anonymous id presented by unauthenticated callers.
    pub anon_id: Option<String>,
    /// Whether the upstream auth layer validated a credential.
    pub authenticated: bool,
    /// Hash of the caller's IP, recorded on the anon token.
    pub ip_hash: Option<String>,
    /// Hash of the caller's user agent, recorded on the anon token.
    pub ua_hash: Option<String>,
}

impl Caller {
    /// True when this caller owns the given task.
    pub fn owns(&self, task: &TaskRecord) -> bool {
        match (&task.user_id, &task.anon_id) {
            (Some(uid), _) => self.user_id.as_deref() == Some(uid.as_str()),
            (None, Some(aid)) => self.anon_id.as_deref() == Some(aid.as_str()),
            (None, None) => false,
        }
    }
}

/// One subtitle line: a timed span of text with an optional speaker label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    /// Segment text, non-empty after trim.
    pub text: String,
    /// Speaker label, e.g. "Speaker 1".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

/// Free-form task parameters. `language` and `detect_language` are
/// recognized; anything else is carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskParams {
    /// Target subtitle language; setting it may imply translation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Ask the provider to detect the source language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect_language: Option<bool>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Body of `POST /tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub source_type: SourceType,
    pub source_url: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub is_trial: Option<bool>,
    #[serde(default)]
    pub params: Option<TaskParams>,
}

/// Response of `POST /tasks`.
#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    /// Seconds the client should wait before polling `GET /tasks/{id}`.
    pub retry_after: u64,
}

/// Task state as returned by `GET /tasks/{id}`.
#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub source_type: SourceType,
    pub is_trial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    pub duration_sec: f64,
    pub cost_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TranscriptResponse>,
}

/// Transcript payload attached to a succeeded task.
#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub segments: Vec<Segment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srt_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vtt_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_url: Option<String>,
}

impl TaskDetailResponse {
    pub fn from_record(task: TaskRecord, transcript: Option<TranscriptRecord>) -> Self {
        let result = transcript.map(|t| TranscriptResponse {
            segments: t.segments,
            srt_url: t.srt_url,
            vtt_url: t.vtt_url,
            raw_url: t.raw_url,
        });

        Self {
            task_id: task.id,
            status: task.status,
            source_type: task.source_type,
            is_trial: task.is_trial,
            engine: task.engine,
            duration_sec: task.duration_sec,
            cost_minutes: task.cost_minutes,
            error: task.error_msg,
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
            result,
        }
    }
}

/// Query parameters of `GET /tasks`.
#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// Opaque cursor: the `created_at` of the last task of the previous page.
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Response of `GET /tasks`.
#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskDetailResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Error response for the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error code, e.g. "TRIAL_EXHAUSTED".
    pub code: String,
    /// Human-readable message.
    pub error: String,
}

/// Response of `GET /status`.
#[derive(Debug, Serialize)]
pub struct ServiceStatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub queue_depth: i64,
}
