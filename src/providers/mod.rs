// External provider adapters
//
// Each adapter turns one external service into a uniform
// [`TranscriptResult`]. Retries and failure classification live here, in the
// adapter, not in a cross-cutting interceptor.

pub mod auto_transcript;
pub mod llm;
pub mod metadata;
pub mod stt;

use thiserror::Error;

use crate::models::Segment;

/// Uniform output of a transcription provider, before normalization.
#[derive(Debug, Clone)]
pub struct TranscriptResult {
    /// Fragmentary, time-ordered chunks as the provider emitted them.
    pub chunks: Vec<Segment>,
    /// Media duration in seconds, as far as the provider reports it.
    pub duration_sec: f64,
    /// Detected or requested language.
    pub language: Option<String>,
    /// True when AI transcription ran; drives billing.
    pub is_generated: bool,
    /// Verbatim provider payload, persisted alongside the transcript.
    pub raw: serde_json::Value,
}

/// Failures talking to an external provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("async job did not finish within {attempts} polls")]
    PollTimeout { attempts: u32 },

    #[error("malformed provider response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether the dispatcher may retry the task after this failure.
    /// Client errors and poll timeouts are final; transport failures and
    /// server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::PollTimeout { .. } => false,
            ProviderError::Parse(_) => false,
            ProviderError::InvalidResponse(_) => false,
        }
    }
}
