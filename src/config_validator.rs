// Configuration validation for the Scribe API
//
// Checks the assembled configuration for values that would make the service
// misbehave at runtime and reports them before anything starts. Errors are
// fatal; warnings are logged and the service starts anyway.

use log::{error, warn};

use crate::config::{AppConfig, ProviderConfig};

/// Results of validating the configuration.
#[derive(Debug, Default)]
pub struct ValidationResults {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResults {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Log all findings at the appropriate level.
    pub fn report(&self) {
        for w in &self.warnings {
            warn!("config: {}", w);
        }
        for e in &self.errors {
            error!("config: {}", e);
        }
    }
}

/// Validate the service configuration.
pub fn validate(app: &AppConfig, providers: &ProviderConfig) -> ValidationResults {
    let mut results = ValidationResults::default();

    if app.task_timeout_minutes <= 0 {
        results
            .errors
            .push("TASK_TIMEOUT_MINUTES must be positive".into());
    }

    if app.max_concurrent_tasks == 0 {
        results
            .errors
            .push("MAX_CONCURRENT_TASKS must be at least 1".into());
    }

    if app.queue_max_attempts == 0 {
        results
            .errors
            .push("QUEUE_MAX_ATTEMPTS must be at least 1".into());
    }

    if app.trial_max_duration_minutes == 0 {
        results
            .warnings
            .push("TRIAL_MAX_DURATION_MINUTES is 0; every trial youtube task will be rejected".into());
    }

    // The polling budget must stay within the sweeper threshold, or every
    // long-running generation gets killed as stuck while it is still polling.
    let poll_budget_secs = providers.auto_transcript_poll_interval_seconds
        * u64::from(providers.auto_transcript_max_poll_attempts);
    if poll_budget_secs > (app.task_timeout_minutes as u64) * 60 + 120 {
        results.warnings.push(format!(
            "auto-transcript poll budget ({poll_budget_secs}s) exceeds the task timeout; \
             polling tasks rely on heartbeats to stay alive"
        ));
    }

    if providers.auto_transcript_url.is_some() && providers.auto_transcript_api_key.is_none() {
        results
            .errors
            .push("AUTO_TRANSCRIPT_API_URL is set but AUTO_TRANSCRIPT_API_KEY is missing".into());
    }

    if providers.stt_url.is_some() && providers.stt_api_key.is_none() {
        results
            .errors
            .push("STT_API_URL is set but STT_API_KEY is missing".into());
    }

    if app.llm_enabled && providers.llm_url.is_none() {
        results
            .errors
            .push("LLM_ENABLED is true but LLM_API_URL is not configured".into());
    }

    if providers.auto_transcript_url.is_none() {
        results
            .warnings
            .push("no auto-transcript provider configured; youtube tasks will fail".into());
    }

    if providers.stt_url.is_none() {
        results
            .warnings
            .push("no STT provider configured; upload/url tasks will fail".into());
    }

    if providers.stt_webhook_secret.is_none() {
        results
            .warnings
            .push("STT_WEBHOOK_SECRET not set; the STT callback endpoint will reject all posts".into());
    }

    results
}
