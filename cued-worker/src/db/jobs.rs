//! SQLite-backed session job queue
//!
//! One row per user in `session_jobs`. A row is active only while its
//! `owner` matches this process's instance id; rows left behind by a
//! previous process are never resumed.

use async_trait::async_trait;
use chrono::Utc;
use cued_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::registry::queue::{JobQueue, JobRecord, JobState, SessionJob};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

pub struct SqliteJobQueue {
    pool: SqlitePool,
    instance_id: Uuid,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, instance_id: Uuid) -> Self {
        Self { pool, instance_id }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(format!("Invalid {} in session_jobs: {}", column, e)))
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: &SessionJob) -> Result<bool> {
        let user_id = job.user_id.clone();
        let job_id = job.job_id.to_string();
        let owner = self.instance_id.to_string();
        let poll_interval_ms = job.poll_interval_ms as i64;
        let total_runs = i64::from(job.total_runs);
        let enqueued_at = Utc::now().to_rfc3339();

        let result = retry_on_lock("enqueue_session_job", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query(
                r#"
                INSERT INTO session_jobs (
                    user_id, job_id, owner, state, poll_interval_ms, total_runs, enqueued_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id) DO NOTHING
                "#,
            )
            .bind(&user_id)
            .bind(&job_id)
            .bind(&owner)
            .bind(JobState::Waiting.to_string())
            .bind(poll_interval_ms)
            .bind(total_runs)
            .bind(&enqueued_at)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, user_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, job_id, owner, state, poll_interval_ms, total_runs, enqueued_at
            FROM session_jobs
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job_id: String = row.get("job_id");
        let owner: String = row.get("owner");
        let state: String = row.get("state");
        let poll_interval_ms: i64 = row.get("poll_interval_ms");
        let total_runs: i64 = row.get("total_runs");
        let enqueued_at: String = row.get("enqueued_at");

        Ok(Some(JobRecord {
            job: SessionJob {
                user_id: row.get("user_id"),
                job_id: parse_uuid("job_id", &job_id)?,
                poll_interval_ms: poll_interval_ms.max(0) as u64,
                total_runs: u32::try_from(total_runs.max(0)).unwrap_or(u32::MAX),
            },
            state: state.parse()?,
            enqueued_at: cued_common::time::parse_rfc3339(&enqueued_at)?,
            active: parse_uuid("owner", &owner)? == self.instance_id,
        }))
    }

    async fn remove(&self, user_id: &str) -> Result<bool> {
        let result = retry_on_lock("remove_session_job", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query("DELETE FROM session_jobs WHERE user_id = ?")
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from)
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, user_id: &str, job_id: Uuid) -> Result<bool> {
        let job_id = job_id.to_string();
        let result = retry_on_lock("complete_session_job", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query("DELETE FROM session_jobs WHERE user_id = ? AND job_id = ?")
                .bind(user_id)
                .bind(&job_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from)
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_running(&self, user_id: &str, job_id: Uuid) -> Result<bool> {
        let job_id = job_id.to_string();
        let owner = self.instance_id.to_string();
        let result = retry_on_lock("mark_session_job_running", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query(
                "UPDATE session_jobs SET state = ? WHERE user_id = ? AND job_id = ? AND owner = ?",
            )
            .bind(JobState::Running.to_string())
            .bind(user_id)
            .bind(&job_id)
            .bind(&owner)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn evict_inactive(&self) -> Result<u64> {
        let owner = self.instance_id.to_string();
        let result = retry_on_lock("evict_inactive_session_jobs", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query("DELETE FROM session_jobs WHERE owner != ?")
                .bind(&owner)
                .execute(&self.pool)
                .await
                .map_err(Error::from)
        })
        .await?;

        Ok(result.rows_affected())
    }
}
