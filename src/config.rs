// Scribe API configuration
//
// This module centralizes configuration parameters and their environment
// defaults. Values come from the environment, optionally pre-seeded from a
// flat TOML file by `config_loader` (environment wins).

use std::env;

/// Default values for configuration
pub mod defaults {
    // Address the HTTP server binds to
    pub const BIND_ADDR: &str = "0.0.0.0:8080";

    // SQLite database location
    pub const DATABASE_URL: &str = "sqlite://scribe.db?mode=rwc";

    // Trial inputs longer than this are rejected at admission
    pub const TRIAL_MAX_DURATION_MINUTES: u64 = 30;

    // Poll interval advertised to clients as `retry_after`
    pub const TASK_POLL_INTERVAL_SECONDS: u64 = 5;

    // Tasks stuck in `processing` longer than this are failed by the sweeper
    pub const TASK_TIMEOUT_MINUTES: i64 = 10;

    // Sweeper cadence
    pub const SWEEP_INTERVAL_SECONDS: u64 = 300;

    // Auto-transcript async job polling
    pub const AUTO_TRANSCRIPT_MAX_POLL_ATTEMPTS: u32 = 120;
    pub const AUTO_TRANSCRIPT_POLL_INTERVAL_SECONDS: u64 = 5;

    // Dispatcher mode and retry policy
    pub const QUEUE_ENABLED: bool = true;
    pub const QUEUE_MAX_ATTEMPTS: u32 = 3;
    pub const QUEUE_RETRY_BASE_SECONDS: u64 = 5;
    pub const QUEUE_POLL_INTERVAL_SECONDS: u64 = 1;
    pub const MAX_CONCURRENT_TASKS: usize = 4;

    // LLM-assisted normalization
    pub const LLM_ENABLED: bool = false;

    // Artifact storage
    pub const ARTIFACT_DIR: &str = "./artifacts";
    pub const ARTIFACT_PUBLIC_BASE_URL: &str = "http://localhost:8080/artifacts";
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

/// Core service configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Bind address for the HTTP server
    pub bind_addr: String,
    /// sqlx-compatible database URL
    pub database_url: String,
    /// Duration cap for trial tasks, in minutes
    pub trial_max_duration_minutes: u64,
    /// Client-facing poll interval (`retry_after`), in seconds
    pub task_poll_interval_seconds: u64,
    /// Sweeper threshold, in minutes
    pub task_timeout_minutes: i64,
    /// Sweeper cadence, in seconds
    pub sweep_interval_seconds: u64,
    /// Durable queue mode when true, in-process cooperative mode when false
    pub queue_enabled: bool,
    /// Retry budget for queue-mode jobs
    pub queue_max_attempts: u32,
    /// Base backoff for queue-mode retries, in seconds
    pub queue_retry_base_seconds: u64,
    /// Queue worker idle poll interval, in seconds
    pub queue_poll_interval_seconds: u64,
    /// Maximum tasks executed concurrently per worker process
    pub max_concurrent_tasks: usize,
    /// LLM-assisted merge/translation enabled
    pub llm_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: env::var("SCRIBE_BIND_ADDR")
                .unwrap_or_else(|_| String::from(defaults::BIND_ADDR)),
            database_url: env::var("SCRIBE_DATABASE_URL")
                .unwrap_or_else(|_| String::from(defaults::DATABASE_URL)),
            trial_max_duration_minutes: env_or(
                "TRIAL_MAX_DURATION_MINUTES",
                defaults::TRIAL_MAX_DURATION_MINUTES,
            ),
            task_poll_interval_seconds: env_or(
                "TASK_POLL_INTERVAL_SECONDS",
                defaults::TASK_POLL_INTERVAL_SECONDS,
            ),
            task_timeout_minutes: env_or("TASK_TIMEOUT_MINUTES", defaults::TASK_TIMEOUT_MINUTES),
            sweep_interval_seconds: env_or(
                "SWEEP_INTERVAL_SECONDS",
                defaults::SWEEP_INTERVAL_SECONDS,
            ),
            queue_enabled: env_or("QUEUE_ENABLED", defaults::QUEUE_ENABLED),
            queue_max_attempts: env_or("QUEUE_MAX_ATTEMPTS", defaults::QUEUE_MAX_ATTEMPTS),
            queue_retry_base_seconds: env_or(
                "QUEUE_RETRY_BASE_SECONDS",
                defaults::QUEUE_RETRY_BASE_SECONDS,
            ),
            queue_poll_interval_seconds: env_or(
                "QUEUE_POLL_INTERVAL_SECONDS",
                defaults::QUEUE_POLL_INTERVAL_SECONDS,
            ),
            max_concurrent_tasks: env_or("MAX_CONCURRENT_TASKS", defaults::MAX_CONCURRENT_TASKS),
            llm_enabled: env_or("LLM_ENABLED", defaults::LLM_ENABLED),
        }
    }
}

/// External provider endpoints and credentials.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Auto-transcript service (native captions + async generation)
    pub auto_transcript_url: Option<String>,
    pub auto_transcript_api_key: Option<String>,
    pub auto_transcript_poll_interval_seconds: u64,
    pub auto_transcript_max_poll_attempts: u32,

    /// Sync speech-to-text service
    pub stt_url: Option<String>,
    pub stt_api_key: Option<String>,
    pub stt_model: String,
    /// Shared secret for the STT callback signature (`dg-signature`)
    pub stt_webhook_secret: Option<String>,

    /// Platform metadata service for duration-based trial gating
    pub metadata_url: Option<String>,
    pub metadata_api_key: Option<String>,

    /// Chat-completion endpoint for LLM-assisted merge/translation
    pub llm_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,

    /// Shared secret for subscription webhook signatures
    pub subscription_webhook_secret: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            auto_transcript_url: env_opt("AUTO_TRANSCRIPT_API_URL"),
            auto_transcript_api_key: env_opt("AUTO_TRANSCRIPT_API_KEY"),
            auto_transcript_poll_interval_seconds: env_or(
                "AUTO_TRANSCRIPT_POLL_INTERVAL_SECONDS",
                defaults::AUTO_TRANSCRIPT_POLL_INTERVAL_SECONDS,
            ),
            auto_transcript_max_poll_attempts: env_or(
                "AUTO_TRANSCRIPT_MAX_POLL_ATTEMPTS",
                defaults::AUTO_TRANSCRIPT_MAX_POLL_ATTEMPTS,
            ),
            stt_url: env_opt("STT_API_URL"),
            stt_api_key: env_opt("STT_API_KEY"),
            stt_model: env::var("STT_MODEL").unwrap_or_else(|_| String::from("nova-2")),
            stt_webhook_secret: env_opt("STT_WEBHOOK_SECRET"),
            metadata_url: env_opt("METADATA_API_URL"),
            metadata_api_key: env_opt("METADATA_API_KEY"),
            llm_url: env_opt("LLM_API_URL"),
            llm_api_key: env_opt("LLM_API_KEY"),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| String::from("gpt-4o-mini")),
            subscription_webhook_secret: env_opt("SUBSCRIPTION_WEBHOOK_SECRET"),
        }
    }
}

/// Artifact storage configuration.
#[derive(Clone, Debug)]
pub struct ArtifactConfig {
    /// Root directory artifacts are written under
    pub root_dir: String,
    /// Base URL public artifact URLs are formed from
    pub public_base_url: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root_dir: env::var("ARTIFACT_DIR")
                .unwrap_or_else(|_| String::from(defaults::ARTIFACT_DIR)),
            public_base_url: env::var("ARTIFACT_PUBLIC_BASE_URL")
                .unwrap_or_else(|_| String::from(defaults::ARTIFACT_PUBLIC_BASE_URL)),
        }
    }
}
