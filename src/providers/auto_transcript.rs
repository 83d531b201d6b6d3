// Auto-transcript provider adapter
//
// Client for the captions service that can either surface pre-existing
// ("native") captions synchronously or synthesize a transcript in an
// asynchronous job that must be polled. Native captions are free; anything
// that took the async generation path is billable.

use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;

use super::{ProviderError, TranscriptResult};
use crate::models::Segment;

/// Engine tag recorded on tasks routed here.
pub const ENGINE: &str = "auto_transcript";

/// Retrieval mode for the transcript endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptMode {
    /// Only pre-existing captions; absence is not an error.
    Native,
    /// Always run AI transcription.
    Generate,
    /// Native first, generation as fallback.
    Auto,
}

impl TranscriptMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptMode::Native => "native",
            TranscriptMode::Generate => "generate",
            TranscriptMode::Auto => "auto",
        }
    }
}

/// Client for the auto-transcript service.
pub struct AutoTranscriptClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

#[derive(Deserialize)]
struct JobAccepted {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Deserialize)]
struct TranscriptBody {
    content: Option<Content>,
    lang: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Chunks(Vec<WireChunk>),
}

#[derive(Deserialize)]
struct WireChunk {
    text: String,
    /// Milliseconds from the start of the media.
    #[serde(alias = "offset_ms")]
    offset: f64,
    /// Chunk length in milliseconds.
    #[serde(alias = "duration_ms")]
    duration: f64,
    #[allow(dead_code)]
    lang: Option<String>,
}

impl AutoTranscriptClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_secs(
                crate::config::defaults::AUTO_TRANSCRIPT_POLL_INTERVAL_SECONDS,
            ),
            max_poll_attempts: crate::config::defaults::AUTO_TRANSCRIPT_MAX_POLL_ATTEMPTS,
        }
    }

    /// Override the polling policy (interval between checks and the hard
    /// attempt cap).
    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_poll_attempts = max_attempts;
        self
    }

    /// Fetch a transcript for `media_url`.
    ///
    /// Returns `Ok(None)` only in native mode when the platform has no
    /// captions for the video. A `202` response switches to job polling;
    /// `is_generated` is preserved through the poll because it decides
    /// whether the task is billed.
    pub async fn fetch(
        &self,
        media_url: &str,
        mode: TranscriptMode,
        lang: Option<&str>,
    ) -> Result<Option<TranscriptResult>, ProviderError> {
        let mut query: Vec<(&str, &str)> = vec![("url", media_url), ("mode", mode.as_str())];
        if let Some(lang) = lang {
            query.push(("lang", lang));
        }

        let response = self
            .http
            .get(format!("{}/v1/transcript", self.base_url))
            .header("x-api-key", &self.api_key)
            .query(&query)
            .send()
            .await?;

        let status = response.status();

        if status.as_u16() == 404 && mode == TranscriptMode::Native {
            debug!("no native captions for {}", media_url);
            return Ok(None);
        }

        if status.as_u16() == 202 {
            let accepted: JobAccepted = response.json().await?;
            debug!("transcript job {} accepted, polling", accepted.job_id);
            let raw = self.poll_job(&accepted.job_id).await?;
            // The async path always means AI generation ran.
            return Ok(Some(into_result(raw, true, mode)?));
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let raw: serde_json::Value = response.json().await?;
        let body: TranscriptBody = serde_json::from_value(raw.clone())?;
        if body.content.is_none() {
            if mode == TranscriptMode::Native {
                return Ok(None);
            }
            return Err(ProviderError::InvalidResponse(
                "success response without content".into(),
            ));
        }

        let is_generated = mode == TranscriptMode::Generate;
        Ok(Some(into_result(raw, is_generated, mode)?))
    }

    /// Poll an async transcript job until its response carries `content`.
    ///
    /// Terminal when `content` is present; intermediate while the service
    /// reports `status: "active"`. The attempt cap bounds total elapsed time
    /// and exhausting it is fatal for the task.
    async fn poll_job(&self, job_id: &str) -> Result<serde_json::Value, ProviderError> {
        for attempt in 1..=self.max_poll_attempts {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .http
                .get(format!("{}/v1/transcript/{}", self.base_url, job_id))
                .header("x-api-key", &self.api_key)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ProviderError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let raw: serde_json::Value = response.json().await?;
            if raw.get("content").map_or(false, |c| !c.is_null()) {
                return Ok(raw);
            }

            let state = raw
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("active");
            if state != "active" {
                warn!("transcript job {} reported state {:?}", job_id, state);
            }
            debug!("transcript job {} still running (poll {})", job_id, attempt);
        }

        Err(ProviderError::PollTimeout {
            attempts: self.max_poll_attempts,
        })
    }
}

fn into_result(
    raw: serde_json::Value,
    is_generated: bool,
    mode: TranscriptMode,
) -> Result<TranscriptResult, ProviderError> {
    let body: TranscriptBody = serde_json::from_value(raw.clone())?;
    let content = body.content.ok_or_else(|| {
        ProviderError::InvalidResponse(format!("{} response without content", mode.as_str()))
    })?;

    let chunks = match content {
        Content::Text(text) => {
            let trimmed = text.trim().to_string();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![Segment {
                    start: 0.0,
                    end: 0.0,
                    text: trimmed,
                    speaker: None,
                }]
            }
        }
        Content::Chunks(wire) => wire
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .map(|c| Segment {
                start: c.offset / 1000.0,
                end: (c.offset + c.duration) / 1000.0,
                text: c.text,
                speaker: None,
            })
            .collect(),
    };

    let duration_sec = chunks.iter().fold(0.0_f64, |acc, s| acc.max(s.end));

    Ok(TranscriptResult {
        chunks,
        duration_sec,
        language: body.lang,
        is_generated,
        raw,
    })
}
