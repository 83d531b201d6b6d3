// Scribe API server
//
// Composition root: loads configuration, wires every component as a plain
// value, starts the background loops (dispatcher, sweeper) and serves the
// HTTP surface.

use std::io;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use log::info;

use scribe_api::artifacts::{ArtifactStore, LocalArtifactStore};
use scribe_api::config::{AppConfig, ArtifactConfig, ProviderConfig};
use scribe_api::dispatcher::{recover_pending, Dispatcher, InProcessDispatcher, QueueDispatcher};
use scribe_api::handlers::{
    get_task, list_tasks, metrics_endpoint, service_status, stt_webhook, submit_task,
    subscription_webhook, AppContext,
};
use scribe_api::providers::auto_transcript::AutoTranscriptClient;
use scribe_api::providers::llm::LlmClient;
use scribe_api::providers::metadata::MetadataClient;
use scribe_api::providers::stt::SttClient;
use scribe_api::sweeper::start_sweeper;
use scribe_api::{
    config_loader, config_validator, BillingLedger, Metrics, SegmentNormalizer, SqliteStore,
    TaskAdmission, TaskExecutor,
};

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    config_loader::load_config();
    let app_config = AppConfig::default();
    let provider_config = ProviderConfig::default();
    let artifact_config = ArtifactConfig::default();

    let validation = config_validator::validate(&app_config, &provider_config);
    validation.report();
    if !validation.is_valid() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "configuration is invalid, refusing to start",
        ));
    }

    let store = Arc::new(
        SqliteStore::connect(&app_config.database_url)
            .await
            .map_err(|e| io::Error::other(format!("database: {e}")))?,
    );

    let metrics = Metrics::new(scribe_api::metrics::create_exporter_from_env());
    let billing = BillingLedger::new(Arc::clone(&store));

    let auto_transcript = match (
        provider_config.auto_transcript_url.clone(),
        provider_config.auto_transcript_api_key.clone(),
    ) {
        (Some(url), Some(key)) => Some(Arc::new(
            AutoTranscriptClient::new(url, key).with_polling(
                std::time::Duration::from_secs(
                    provider_config.auto_transcript_poll_interval_seconds,
                ),
                provider_config.auto_transcript_max_poll_attempts,
            ),
        )),
        _ => None,
    };
    let stt = match (
        provider_config.stt_url.clone(),
        provider_config.stt_api_key.clone(),
    ) {
        (Some(url), Some(key)) => Some(Arc::new(SttClient::new(
            url,
            key,
            provider_config.stt_model.clone(),
        ))),
        _ => None,
    };
    let metadata = match (
        provider_config.metadata_url.clone(),
        provider_config.metadata_api_key.clone(),
    ) {
        (Some(url), Some(key)) => Some(Arc::new(MetadataClient::new(url, key))),
        _ => None,
    };
    let llm = if app_config.llm_enabled {
        provider_config.llm_url.clone().map(|url| {
            Arc::new(LlmClient::new(
                url,
                provider_config.llm_api_key.clone().unwrap_or_default(),
                provider_config.llm_model.clone(),
            ))
        })
    } else {
        None
    };

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(
        artifact_config.root_dir.clone(),
        artifact_config.public_base_url.clone(),
    ));

    let executor = Arc::new(TaskExecutor::new(
        Arc::clone(&store),
        billing.clone(),
        SegmentNormalizer::new(llm),
        auto_transcript,
        stt,
        artifacts,
        metrics.clone(),
    ));

    let dispatcher: Arc<dyn Dispatcher> = if app_config.queue_enabled {
        let queue = QueueDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            metrics.clone(),
            &app_config,
        );
        queue.start();
        queue
    } else {
        Arc::new(InProcessDispatcher::start(
            Arc::clone(&executor),
            Arc::clone(&store),
        ))
    };

    // Re-enqueue whatever the previous process left pending; the sweeper
    // handles everything that was mid-flight.
    recover_pending(store.as_ref(), dispatcher.as_ref(), app_config.task_timeout_minutes)
        .await
        .map_err(|e| io::Error::other(format!("startup recovery: {e}")))?;

    start_sweeper(
        Arc::clone(&store),
        metrics.clone(),
        app_config.task_timeout_minutes,
        app_config.sweep_interval_seconds,
    );

    let admission = Arc::new(TaskAdmission::new(
        Arc::clone(&store),
        billing.clone(),
        metadata,
        Arc::clone(&dispatcher),
        metrics.clone(),
        app_config.trial_max_duration_minutes,
        app_config.task_poll_interval_seconds,
    ));

    let context = web::Data::new(AppContext {
        store,
        admission,
        executor,
        billing,
        metrics,
        stt_webhook_secret: provider_config.stt_webhook_secret.clone(),
        subscription_webhook_secret: provider_config.subscription_webhook_secret.clone(),
    });

    info!(
        "starting scribe API on {} (queue mode: {})",
        app_config.bind_addr, app_config.queue_enabled
    );

    HttpServer::new(move || {
        App::new()
            .app_data(context.clone())
            .service(submit_task)
            .service(get_task)
            .service(list_tasks)
            .service(service_status)
            .service(metrics_endpoint)
            .service(stt_webhook)
            .service(subscription_webhook)
    })
    .bind(&app_config.bind_addr)?
    .run()
    .await
}
