// SQLite implementation of the store traits.
//
// Uses sqlx with the `sqlite` feature. Migrations are embedded at compile
// time from ./migrations and run automatically in `connect`. The
// runtime-verified `sqlx::query` form is used deliberately so no
// DATABASE_URL is needed at compile time.
//
// Timestamps are RFC 3339 text with fixed-width microsecond precision and a
// `Z` suffix, so lexicographic comparison in SQL matches chronological
// order. All state transitions are conditional updates; the caller learns
// from `rows_affected` whether its transition applied.

use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;
use sqlx::SqlitePool;

use super::{
    AnonTokenRecord, BalanceRecord, BalanceStore, EventStore, QueueJobRecord, QueueStore,
    SourceType, TaskPriority, TaskRecord, TaskStatus, TaskStore, TranscriptRecord,
    TranscriptStore, TrialStore,
};
use crate::models::TaskParams;

/// SQLite-backed store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and run pending migrations.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same database (`:memory:` is per-connection in SQLite).
    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Force a task's `updated_at` into the past, for timeout tests.
    #[cfg(test)]
    pub async fn backdate_task_updated_at(&self, id: &str, ts: DateTime<Utc>) {
        sqlx::query("UPDATE tasks SET updated_at = ?1 WHERE id = ?2")
            .bind(fmt_ts(ts))
            .bind(id)
            .execute(&self.pool)
            .await
            .expect("backdate task");
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e| {
        warn!("failed to parse stored timestamp {:?}: {}; using now", raw, e);
        Utc::now()
    })
}

fn parse_params(raw: &str) -> TaskParams {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("failed to parse stored task params: {}; using empty", e);
        TaskParams::default()
    })
}

type TaskRow = (
    String,         // id
    Option<String>, // user_id
    Option<String>, // anon_id
    String,         // source_type
    String,         // task_type
    i64,            // is_trial
    String,         // priority
    String,         // source_url
    String,         // params
    String,         // status
    Option<String>, // engine
    f64,            // duration_sec
    i64,            // cost_minutes
    Option<String>, // error_msg
    String,         // created_at
    String,         // updated_at
);

const TASK_COLUMNS: &str = "id, user_id, anon_id, source_type, task_type, is_trial, priority, \
     source_url, params, status, engine, duration_sec, cost_minutes, error_msg, created_at, updated_at";

fn map_task_row(row: TaskRow) -> TaskRecord {
    let (
        id,
        user_id,
        anon_id,
        source_type,
        task_type,
        is_trial,
        priority,
        source_url,
        params,
        status,
        engine,
        duration_sec,
        cost_minutes,
        error_msg,
        created_at,
        updated_at,
    ) = row;

    TaskRecord {
        id,
        user_id,
        anon_id,
        source_type: SourceType::parse(&source_type).unwrap_or(SourceType::Url),
        task_type,
        is_trial: is_trial != 0,
        priority: TaskPriority::parse(&priority).unwrap_or(TaskPriority::Free),
        source_url,
        params: parse_params(&params),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        engine,
        duration_sec,
        cost_minutes,
        error_msg,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    }
}

impl TaskStore for SqliteStore {
    async fn insert_pending(&self, record: &TaskRecord) -> Result<bool, sqlx::Error> {
        let params = serde_json::to_string(&record.params).unwrap_or_else(|_| "{}".into());

        // The NOT EXISTS guard serializes racing admissions from the same
        // owner: of two concurrent inserts exactly one sees zero active rows.
        let result = sqlx::query(
            "INSERT INTO tasks (id, user_id, anon_id, source_type, task_type, is_trial, priority, \
                                source_url, params, status, duration_sec, cost_minutes, created_at, updated_at) \
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', 0, 0, ?10, ?11 \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM tasks \
                 WHERE status IN ('pending', 'processing') \
                   AND ((?2 IS NOT NULL AND user_id = ?2) OR (?3 IS NOT NULL AND anon_id = ?3)) \
             )",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.anon_id)
        .bind(record.source_type.as_str())
        .bind(&record.task_type)
        .bind(record.is_trial as i64)
        .bind(record.priority.as_str())
        .bind(&record.source_url)
        .bind(&params)
        .bind(fmt_ts(record.created_at))
        .bind(fmt_ts(record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, sqlx::Error> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(map_task_row))
    }

    async fn has_active_task(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM tasks \
             WHERE status IN ('pending', 'processing') \
               AND ((?1 IS NOT NULL AND user_id = ?1) OR (?2 IS NOT NULL AND anon_id = ?2)) \
             LIMIT 1",
        )
        .bind(user_id)
        .bind(anon_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn list_tasks(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
        status: Option<TaskStatus>,
        cursor: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE ((?1 IS NOT NULL AND user_id = ?1) OR (?2 IS NOT NULL AND anon_id = ?2)) \
               AND (?3 IS NULL OR status = ?3) \
               AND (?4 IS NULL OR created_at < ?4) \
             ORDER BY created_at DESC \
             LIMIT ?5"
        ))
        .bind(user_id)
        .bind(anon_id)
        .bind(status.map(|s| s.as_str()))
        .bind(cursor.map(fmt_ts))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(map_task_row).collect())
    }

    async fn claim_task(&self, id: &str, allow_resume: bool) -> Result<bool, sqlx::Error> {
        let sql = if allow_resume {
            "UPDATE tasks SET status = 'processing', updated_at = ?2 \
             WHERE id = ?1 AND status IN ('pending', 'processing')"
        } else {
            "UPDATE tasks SET status = 'processing', updated_at = ?2 \
             WHERE id = ?1 AND status = 'pending'"
        };
        let result = sqlx::query(sql)
            .bind(id)
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_engine(&self, id: &str, engine: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET engine = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status = 'processing'",
        )
        .bind(id)
        .bind(engine)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_processing(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET updated_at = ?2 WHERE id = ?1 AND status = 'processing'",
        )
        .bind(id)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_succeeded(
        &self,
        id: &str,
        duration_sec: f64,
        cost_minutes: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'succeeded', duration_sec = ?2, cost_minutes = ?3, \
                              updated_at = ?4 \
             WHERE id = ?1 AND status = 'processing'",
        )
        .bind(id)
        .bind(duration_sec)
        .bind(cost_minutes)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_failed(&self, id: &str, error_msg: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', error_msg = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .bind(error_msg)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn sweep_stuck(
        &self,
        cutoff: DateTime<Utc>,
        error_msg: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', error_msg = ?2, updated_at = ?3 \
             WHERE status = 'processing' AND updated_at < ?1",
        )
        .bind(fmt_ts(cutoff))
        .bind(error_msg)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn pending_tasks(&self) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(map_task_row).collect())
    }
}

impl TranscriptStore for SqliteStore {
    async fn upsert_transcript(&self, record: &TranscriptRecord) -> Result<(), sqlx::Error> {
        let segments = serde_json::to_string(&record.segments).unwrap_or_else(|_| "[]".into());
        let raw = record.raw_payload.to_string();

        sqlx::query(
            "INSERT INTO transcripts (task_id, segments, raw_payload, srt_url, vtt_url, raw_url, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(task_id) DO UPDATE SET \
                 segments = excluded.segments, \
                 raw_payload = excluded.raw_payload, \
                 srt_url = excluded.srt_url, \
                 vtt_url = excluded.vtt_url, \
                 raw_url = excluded.raw_url",
        )
        .bind(&record.task_id)
        .bind(&segments)
        .bind(&raw)
        .bind(&record.srt_url)
        .bind(&record.vtt_url)
        .bind(&record.raw_url)
        .bind(fmt_ts(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transcript(
        &self,
        task_id: &str,
    ) -> Result<Option<TranscriptRecord>, sqlx::Error> {
        let row: Option<(String, String, String, Option<String>, Option<String>, Option<String>, String)> =
            sqlx::query_as(
                "SELECT task_id, segments, raw_payload, srt_url, vtt_url, raw_url, created_at \
                 FROM transcripts WHERE task_id = ?1",
            )
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(
            |(task_id, segments, raw_payload, srt_url, vtt_url, raw_url, created_at)| {
                TranscriptRecord {
                    task_id,
                    segments: serde_json::from_str(&segments).unwrap_or_default(),
                    raw_payload: serde_json::from_str(&raw_payload)
                        .unwrap_or(serde_json::Value::Null),
                    srt_url,
                    vtt_url,
                    raw_url,
                    created_at: parse_ts(&created_at),
                }
            },
        ))
    }
}

impl BalanceStore for SqliteStore {
    async fn ensure_balance(&self, user_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO balances (user_id, minutes_balance, updated_at) VALUES (?1, 0, ?2)",
        )
        .bind(user_id)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_balance(&self, user_id: &str) -> Result<Option<BalanceRecord>, sqlx::Error> {
        let row: Option<(String, i64, String)> = sqlx::query_as(
            "SELECT user_id, minutes_balance, updated_at FROM balances WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id, minutes_balance, updated_at)| BalanceRecord {
            user_id,
            minutes_balance,
            updated_at: parse_ts(&updated_at),
        }))
    }

    async fn add_minutes(&self, user_id: &str, minutes: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO balances (user_id, minutes_balance, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(user_id) DO UPDATE SET \
                 minutes_balance = minutes_balance + excluded.minutes_balance, \
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(minutes)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deduct_minutes(&self, user_id: &str, minutes: i64) -> Result<bool, sqlx::Error> {
        // Optimistic guard: the WHERE clause re-checks the balance, so
        // concurrent deductions are linearizable and never go negative.
        let result = sqlx::query(
            "UPDATE balances SET minutes_balance = minutes_balance - ?2, updated_at = ?3 \
             WHERE user_id = ?1 AND minutes_balance >= ?2",
        )
        .bind(user_id)
        .bind(minutes)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

impl TrialStore for SqliteStore {
    async fn ensure_anon_token(
        &self,
        anon_id: &str,
        ip_hash: Option<&str>,
        ua_hash: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO anon_tokens (anon_id, ip_hash, ua_hash, used_trial) \
             VALUES (?1, ?2, ?3, 0)",
        )
        .bind(anon_id)
        .bind(ip_hash)
        .bind(ua_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_anon_token(&self, anon_id: &str) -> Result<Option<AnonTokenRecord>, sqlx::Error> {
        let row: Option<(String, Option<String>, Option<String>, i64)> = sqlx::query_as(
            "SELECT anon_id, ip_hash, ua_hash, used_trial FROM anon_tokens WHERE anon_id = ?1",
        )
        .bind(anon_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(anon_id, ip_hash, ua_hash, used_trial)| AnonTokenRecord {
            anon_id,
            ip_hash,
            ua_hash,
            used_trial: used_trial != 0,
        }))
    }

    async fn mark_trial_used(&self, anon_id: &str) -> Result<(), sqlx::Error> {
        // Idempotent: concurrent flips land on the same final state.
        sqlx::query(
            "INSERT INTO anon_tokens (anon_id, used_trial) VALUES (?1, 1) \
             ON CONFLICT(anon_id) DO UPDATE SET used_trial = 1",
        )
        .bind(anon_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_trial_usage(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO trial_usages (user_id, anon_id, used_at) VALUES (?1, ?2, ?3)")
            .bind(user_id)
            .bind(anon_id)
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_used_trial(
        &self,
        user_id: Option<&str>,
        anon_id: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        if let Some(uid) = user_id {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT 1 FROM trial_usages WHERE user_id = ?1 LIMIT 1")
                    .bind(uid)
                    .fetch_optional(&self.pool)
                    .await?;
            if row.is_some() {
                return Ok(true);
            }
        }

        if let Some(aid) = anon_id {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT 1 FROM anon_tokens WHERE anon_id = ?1 AND used_trial = 1")
                    .bind(aid)
                    .fetch_optional(&self.pool)
                    .await?;
            if row.is_some() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn bind_trials_to_user(&self, user_id: &str, anon_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE trial_usages SET user_id = ?1 WHERE anon_id = ?2 AND user_id IS NULL",
        )
        .bind(user_id)
        .bind(anon_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

impl QueueStore for SqliteStore {
    async fn enqueue_job(
        &self,
        task_id: &str,
        priority: i64,
        payload: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO queue_jobs (task_id, priority, payload, attempts, next_run_at) \
             VALUES (?1, ?2, ?3, 0, ?4)",
        )
        .bind(task_id)
        .bind(priority)
        .bind(payload)
        .bind(fmt_ts(next_run_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due_job(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJobRecord>, sqlx::Error> {
        // Select-then-claim loop: losing a claim race just means another
        // worker took that job, so try the next candidate.
        loop {
            let row: Option<(i64, String, i64, String, i64, String)> = sqlx::query_as(
                "SELECT id, task_id, priority, payload, attempts, next_run_at FROM queue_jobs \
                 WHERE claimed_at IS NULL AND next_run_at <= ?1 \
                 ORDER BY priority ASC, next_run_at ASC, id ASC \
                 LIMIT 1",
            )
            .bind(fmt_ts(now))
            .fetch_optional(&self.pool)
            .await?;

            let Some((id, task_id, priority, payload, attempts, next_run_at)) = row else {
                return Ok(None);
            };

            let claimed = sqlx::query(
                "UPDATE queue_jobs SET claimed_at = ?2 WHERE id = ?1 AND claimed_at IS NULL",
            )
            .bind(id)
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                return Ok(Some(QueueJobRecord {
                    id,
                    task_id,
                    priority,
                    payload,
                    attempts,
                    next_run_at: parse_ts(&next_run_at),
                }));
            }
        }
    }

    async fn complete_job(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_job(
        &self,
        id: i64,
        attempts: i64,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE queue_jobs SET attempts = ?2, next_run_at = ?3, claimed_at = NULL WHERE id = ?1",
        )
        .bind(id)
        .bind(attempts)
        .bind(fmt_ts(next_run_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET claimed_at = NULL \
             WHERE claimed_at IS NOT NULL AND claimed_at < ?1",
        )
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn task_has_job(&self, task_id: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM queue_jobs WHERE task_id = ?1 LIMIT 1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn queue_depth(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

impl EventStore for SqliteStore {
    async fn record_event_once(&self, event_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO webhook_events (event_id, processed_at) VALUES (?1, ?2)",
        )
        .bind(event_id)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
