// Dispatcher
//
// Hands admitted tasks to the executor. Two interchangeable modes sit
// behind the same `enqueue` contract: a durable priority queue backed by
// the store (production), and an in-process cooperative runner
// (development, single node). Queue mode delivers at least once with a
// bounded retry budget; the executor's conditional state transitions make
// duplicate delivery harmless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::executor::TaskExecutor;
use crate::metrics::Metrics;
use crate::models::TaskParams;
use crate::store::{
    sqlite::SqliteStore, QueueJobRecord, QueueStore, SourceType, TaskPriority, TaskRecord,
    TaskStore,
};

/// Opaque job envelope: a snapshot of what the worker needs to start.
/// Workers re-read the authoritative task row on pickup, so the snapshot
/// never overrides persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub task_id: String,
    pub source_type: SourceType,
    pub source_url: String,
    pub params: TaskParams,
}

impl JobEnvelope {
    pub fn for_task(task: &TaskRecord) -> Self {
        Self {
            task_id: task.id.clone(),
            source_type: task.source_type,
            source_url: task.source_url.clone(),
            params: task.params.clone(),
        }
    }
}

/// Errors enqueueing work.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("queue storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("dispatcher is not running")]
    ChannelClosed,
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// The contract admission dispatches through.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn enqueue(&self, job: JobEnvelope, priority: TaskPriority) -> Result<(), DispatchError>;

    /// True when jobs survive a process restart (queue mode).
    fn is_durable(&self) -> bool;
}

/// Durable, store-backed priority queue dispatcher.
pub struct QueueDispatcher {
    store: Arc<SqliteStore>,
    executor: Arc<TaskExecutor>,
    metrics: Metrics,
    max_attempts: i64,
    retry_base: Duration,
    poll_interval: Duration,
    max_concurrent: usize,
}

impl QueueDispatcher {
    pub fn new(
        store: Arc<SqliteStore>,
        executor: Arc<TaskExecutor>,
        metrics: Metrics,
        config: &AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            metrics,
            max_attempts: i64::from(config.queue_max_attempts.max(1)),
            retry_base: Duration::from_secs(config.queue_retry_base_seconds),
            poll_interval: Duration::from_secs(config.queue_poll_interval_seconds.max(1)),
            max_concurrent: config.max_concurrent_tasks.max(1),
        })
    }

    /// Start the worker loop. Claims due jobs in priority order and runs up
    /// to `max_concurrent` of them at once.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "queue worker started (max {} concurrent tasks)",
                this.max_concurrent
            );
            let semaphore = Arc::new(Semaphore::new(this.max_concurrent));

            loop {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return, // semaphore closed: shutting down
                };

                match this.store.claim_due_job(Utc::now()).await {
                    Ok(Some(job)) => {
                        let runner = Arc::clone(&this);
                        tokio::spawn(async move {
                            runner.process(job).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        if let Ok(depth) = this.store.queue_depth().await {
                            this.metrics.set_queue_depth(depth as f64).await;
                        }
                        tokio::time::sleep(this.poll_interval).await;
                    }
                    Err(e) => {
                        drop(permit);
                        error!("queue poll failed: {}", e);
                        tokio::time::sleep(this.poll_interval).await;
                    }
                }
            }
        })
    }

    /// Run one claimed job and apply the retry policy to its outcome.
    async fn process(&self, job: QueueJobRecord) {
        let attempt = job.attempts + 1;
        debug!("job {} for task {} (attempt {})", job.id, job.task_id, attempt);

        match self.executor.execute(&job.task_id, attempt > 1).await {
            Ok(()) => {
                if let Err(e) = self.store.complete_job(job.id).await {
                    error!("job {} done but not removed from queue: {}", job.id, e);
                }
            }
            Err(failure) => {
                if attempt >= self.max_attempts {
                    warn!(
                        "task {} exhausted {} attempts: {}",
                        job.task_id, attempt, failure.message
                    );
                    if let Err(e) = self
                        .store
                        .finish_failed(&job.task_id, &failure.message)
                        .await
                    {
                        error!("task {}: could not record final failure: {}", job.task_id, e);
                    }
                    if let Err(e) = self.store.complete_job(job.id).await {
                        error!("job {} not removed from queue: {}", job.id, e);
                    }
                } else {
                    let delay = self.backoff(attempt);
                    debug!(
                        "task {} attempt {} failed, retrying in {:?}",
                        job.task_id, attempt, delay
                    );
                    let next_run_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(5));
                    if let Err(e) = self.store.retry_job(job.id, attempt, next_run_at).await {
                        error!("job {} could not be rescheduled: {}", job.id, e);
                    }
                }
            }
        }
    }

    /// Exponential backoff: base · 2^(attempt−1).
    fn backoff(&self, attempt: i64) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
        self.retry_base * 2u32.saturating_pow(exponent)
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn enqueue(&self, job: JobEnvelope, priority: TaskPriority) -> Result<(), DispatchError> {
        let payload = serde_json::to_string(&job).unwrap_or_else(|_| "{}".into());
        self.store
            .enqueue_job(&job.task_id, priority.queue_level(), &payload, Utc::now())
            .await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// In-process cooperative dispatcher: FIFO, no persistence, no priority.
/// Crashes drop pending jobs; boot-time recovery re-enqueues whatever rows
/// were still `pending`, and the sweeper covers the rest.
pub struct InProcessDispatcher {
    tx: mpsc::UnboundedSender<JobEnvelope>,
}

impl InProcessDispatcher {
    /// Build the dispatcher and start its runner on the local executor.
    pub fn start(executor: Arc<TaskExecutor>, store: Arc<SqliteStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobEnvelope>();

        tokio::spawn(async move {
            info!("in-process dispatcher started");
            while let Some(job) = rx.recv().await {
                if let Err(failure) = executor.execute(&job.task_id, false).await {
                    // No retry budget in this mode; a retriable failure is
                    // final here.
                    warn!(
                        "task {} failed in-process: {}",
                        job.task_id, failure.message
                    );
                    if let Err(e) = store.finish_failed(&job.task_id, &failure.message).await {
                        error!("task {}: could not record failure: {}", job.task_id, e);
                    }
                }
            }
        });

        Self { tx }
    }
}

#[async_trait]
impl Dispatcher for InProcessDispatcher {
    async fn enqueue(&self, job: JobEnvelope, _priority: TaskPriority) -> Result<(), DispatchError> {
        self.tx.send(job).map_err(|_| DispatchError::ChannelClosed)
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Boot-time recovery: release claims abandoned by crashed workers and
/// re-enqueue every `pending` task that has no job behind it. Pending rows
/// are never failed at boot; admission already accepted the work.
pub async fn recover_pending(
    store: &SqliteStore,
    dispatcher: &dyn Dispatcher,
    stale_claim_cutoff_minutes: i64,
) -> Result<usize, DispatchError> {
    if dispatcher.is_durable() {
        let cutoff = Utc::now() - chrono::Duration::minutes(stale_claim_cutoff_minutes);
        let released = store.release_stale_claims(cutoff).await?;
        if released > 0 {
            info!("released {} stale queue claims", released);
        }
    }

    let mut recovered = 0usize;
    for task in store.pending_tasks().await? {
        if dispatcher.is_durable() && store.task_has_job(&task.id).await? {
            continue;
        }
        dispatcher
            .enqueue(JobEnvelope::for_task(&task), task.priority)
            .await?;
        recovered += 1;
    }

    if recovered > 0 {
        info!("re-enqueued {} pending tasks at boot", recovered);
    }
    Ok(recovered)
}
