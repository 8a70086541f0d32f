//! Postgres-backed job store.
//!
//! Table `jobs` (see `migrations/0001_rollcall.sql`). Status is stored as text and the
//! status state machine is enforced by conditional updates: every transition names the
//! status it expects to leave (`WHERE id = $1 AND status = ...`). When an update touches
//! no row, a follow-up read tells a missing row (`NotFound`) apart from a row in the
//! wrong state (`NotClaimable` / `InvalidTransition`).
//!
//! The claim in `mark_processing` is atomic, so two processors pointed at the same
//! database never both run one job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{PersistenceError, map_sqlx_error};

use super::store::{JobStats, JobStore};
use super::types::{EnqueueOptions, Job, JobId, JobKind, JobStatus};

const JOB_COLUMNS: &str = "id, kind, payload, priority, scheduled_at, attempts, max_attempts, \
                           status, error, created_at, updated_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn status_of(&self, id: JobId) -> Result<Option<JobStatus>, PersistenceError> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_status", e))?;

        match row {
            Some(row) => {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| map_sqlx_error("job_status", e))?;
                Ok(Some(status.parse()?))
            }
            None => Ok(None),
        }
    }

    /// Explain why a conditional transition touched no row.
    async fn rejected_transition(&self, id: JobId, to: JobStatus) -> PersistenceError {
        match self.status_of(id).await {
            Ok(None) => PersistenceError::job_not_found(id),
            Ok(Some(from)) if to == JobStatus::Processing => {
                PersistenceError::NotClaimable { id, status: from }
            }
            Ok(Some(from)) => PersistenceError::InvalidTransition { id, from, to },
            Err(e) => e,
        }
    }

    async fn fetch_jobs(
        &self,
        operation: &'static str,
        sql: &str,
        status: JobStatus,
        limit: usize,
        now: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>, PersistenceError> {
        let mut query = sqlx::query(sql)
            .bind(status.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));
        if let Some(now) = now {
            query = query.bind(now);
        }

        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter()
            .map(|row| -> Result<Job, PersistenceError> {
                JobRow::from_row(row)
                    .map_err(|e| map_sqlx_error(operation, e))?
                    .try_into()
            })
            .collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip_all, fields(kind = %kind), err)]
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, PersistenceError> {
        let job = Job::new(kind, payload, options, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, payload, priority, scheduled_at, attempts, max_attempts,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, 'pending', $7, $7)
            "#,
        )
        .bind(job.id.0)
        .bind(job.kind.as_str())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.scheduled_at)
        .bind(to_db_int(job.max_attempts))
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(job.id)
    }

    #[instrument(skip(self), err)]
    async fn fetch_due(&self, limit: usize) -> Result<Vec<Job>, PersistenceError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = $1 AND scheduled_at <= $3 \
             ORDER BY priority DESC, scheduled_at ASC, created_at ASC \
             LIMIT $2"
        );
        self.fetch_jobs("fetch_due", &sql, JobStatus::Pending, limit, Some(Utc::now()))
            .await
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn mark_processing(&self, id: JobId) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.0)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processing", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, JobStatus::Processing).await);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn mark_completed(&self, id: JobId) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, JobStatus::Completed).await);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                attempts = LEAST(attempts + 1, max_attempts),
                error = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, JobStatus::Failed).await);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn reschedule(
        &self,
        id: JobId,
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = LEAST($2, max_attempts),
                scheduled_at = $3,
                error = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(to_db_int(attempts))
        .bind(scheduled_at)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, JobStatus::Pending).await);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, PersistenceError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| -> Result<Job, PersistenceError> {
            JobRow::from_row(&row)
                .map_err(|e| map_sqlx_error("get_job", e))?
                .try_into()
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, PersistenceError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 \
             ORDER BY created_at ASC LIMIT $2"
        );
        self.fetch_jobs("list_by_status", &sql, status, limit, None).await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, PersistenceError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("job_stats", e))?;
            let count: i64 = row.try_get("n").map_err(|e| map_sqlx_error("job_stats", e))?;
            stats.record(status.parse()?, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Raw `jobs` row.
struct JobRow {
    id: Uuid,
    kind: String,
    payload: serde_json::Value,
    priority: i32,
    scheduled_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    status: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            scheduled_at: row.try_get("scheduled_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = PersistenceError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let non_negative = |field: &str, v: i32| {
            u32::try_from(v)
                .map_err(|_| PersistenceError::Rejected(format!("negative {field} on job {id}")))
        };

        Ok(Job {
            id: JobId::from_uuid(id),
            kind: row.kind.parse()?,
            payload: row.payload,
            priority: row.priority,
            scheduled_at: row.scheduled_at,
            attempts: non_negative("attempts", row.attempts)?,
            max_attempts: non_negative("max_attempts", row.max_attempts)?,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_error: row.error,
        })
    }
}
