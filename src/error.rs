// Error handling for the Scribe API
//
// This module defines the stable, user-surfaced error taxonomy and the
// mapping from internal failures onto it. Admission errors surface
// synchronously on the creation endpoint; execution errors surface on the
// task row instead and never pass through here.

use thiserror::Error;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};

use crate::models::ErrorResponse;

/// Errors surfaced by the HTTP API with stable codes.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed URL, unsupported source type, missing required field, or a
    /// failed video-metadata lookup during trial gating.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No credentials and no anonymous id on an endpoint that requires identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Cross-owner access to a task, or an invalid webhook signature.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The caller has already consumed their one-shot trial.
    #[error("trial already used")]
    TrialExhausted,

    /// Trial input exceeds the duration cap.
    #[error("video duration exceeds the trial limit of {limit_minutes} minutes")]
    DurationExceeded { limit_minutes: u64 },

    /// Paid request with a zero balance.
    #[error("minutes balance is empty")]
    InsufficientBalance,

    /// The owner already has a task in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown task id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Storage failure.
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::TrialExhausted => "TRIAL_EXHAUSTED",
            ApiError::DurationExceeded { .. } => "DURATION_EXCEEDED",
            ApiError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Internal(_) | ApiError::Database(_) => "INTERNAL_ERROR",
        }
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_)
            | ApiError::TrialExhausted
            | ApiError::DurationExceeded { .. }
            | ApiError::InsufficientBalance => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) | ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Internal details stay in the log; clients get the stable code.
        let message = match self {
            ApiError::Internal(_) | ApiError::Database(_) => "internal error".to_string(),
            other => other.to_string(),
        };

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            code: self.code().to_string(),
            error: message,
        })
    }
}
