// Stuck-task sweeper
//
// Periodic safety net: any task sitting in `processing` past the timeout
// is failed in one batch update. This is the sole recovery mechanism when
// a worker crashes mid-task or a provider hangs past all retries. Runs on
// a fixed cadence and once at process start.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, warn};
use tokio::task::JoinHandle;

use crate::metrics::Metrics;
use crate::store::{sqlite::SqliteStore, TaskStore};

/// Error message written on swept tasks.
pub const TIMEOUT_ERROR: &str = "task timeout";

/// One sweep pass: fail everything stuck in `processing` since before
/// `timeout_minutes` ago.
pub async fn sweep_once(store: &SqliteStore, timeout_minutes: i64) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - chrono::Duration::minutes(timeout_minutes);
    store.sweep_stuck(cutoff, TIMEOUT_ERROR).await
}

/// Start the periodic sweeper. The first tick fires immediately, covering
/// tasks orphaned by the previous process.
pub fn start_sweeper(
    store: Arc<SqliteStore>,
    metrics: Metrics,
    timeout_minutes: i64,
    interval_seconds: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        loop {
            interval.tick().await;
            match sweep_once(&store, timeout_minutes).await {
                Ok(0) => {}
                Ok(count) => {
                    warn!("sweeper failed {} stuck tasks", count);
                    metrics.record_tasks_swept(count).await;
                }
                Err(e) => error!("sweeper pass failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskParams;
    use crate::store::{SourceType, TaskPriority, TaskRecord, TaskStatus};

    async fn processing_task(store: &SqliteStore, id: &str) {
        let now = Utc::now();
        let record = TaskRecord {
            id: id.to_string(),
            // Distinct owners so both tasks can be active at once.
            user_id: Some(format!("owner-{id}")),
            anon_id: None,
            source_type: SourceType::Url,
            task_type: "transcription".into(),
            is_trial: false,
            priority: TaskPriority::Paid,
            source_url: "https://cdn.example/a.mp3".into(),
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
        assert!(store.claim_task(id, false).await.unwrap());
    }

    #[tokio::test]
    async fn sweeps_only_past_threshold() {
        let store = SqliteStore::connect_in_memory().await.unwrap();

        processing_task(&store, "stuck").await;
        processing_task(&store, "alive").await;
        store
            .backdate_task_updated_at("stuck", Utc::now() - chrono::Duration::minutes(11))
            .await;
        store
            .backdate_task_updated_at("alive", Utc::now() - chrono::Duration::minutes(9))
            .await;

        let swept = sweep_once(&store, 10).await.unwrap();
        assert_eq!(swept, 1);

        let stuck = store.get_task("stuck").await.unwrap().unwrap();
        assert_eq!(stuck.status, TaskStatus::Failed);
        assert_eq!(stuck.error_msg.as_deref(), Some(TIMEOUT_ERROR));

        let alive = store.get_task("alive").await.unwrap().unwrap();
        assert_eq!(alive.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn pending_tasks_are_never_swept() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let now = Utc::now();
        let record = TaskRecord {
            id: "p1".into(),
            user_id: Some("u1".into()),
            anon_id: None,
            source_type: SourceType::Url,
            task_type: "transcription".into(),
            is_trial: false,
            priority: TaskPriority::Paid,
            source_url: "https://cdn.example/a.mp3".into(),
            params: TaskParams::default(),
            status: TaskStatus::Pending,
            engine: None,
            duration_sec: 0.0,
            cost_minutes: 0,
            error_msg: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_pending(&record).await.unwrap();
        store
            .backdate_task_updated_at("p1", Utc::now() - chrono::Duration::hours(2))
            .await;

        assert_eq!(sweep_once(&store, 10).await.unwrap(), 0);
    }
}
