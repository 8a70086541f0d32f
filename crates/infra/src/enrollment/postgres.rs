//! Postgres adapters over `classes`, `enrollments` and `enrollment_requests`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use rollcall_core::{ClassId, EnrollmentRequestId, StudentId};

use crate::error::{PersistenceError, map_sqlx_error};

use super::{
    ClassCapacity, ClassCapacityReader, ClassRoster, EnrollmentRequest, EnrollmentRequestStore,
};

#[derive(Debug, Clone)]
pub struct PostgresEnrollmentStore {
    pool: Arc<PgPool>,
}

impl PostgresEnrollmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn capacity_from_row(operation: &str, row: &PgRow) -> Result<ClassCapacity, PersistenceError> {
    let capacity: i32 = row
        .try_get("capacity")
        .map_err(|e| map_sqlx_error(operation, e))?;
    let current: i32 = row
        .try_get("current_enrollment")
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(ClassCapacity::new(i64::from(capacity), i64::from(current)))
}

#[async_trait]
impl ClassCapacityReader for PostgresEnrollmentStore {
    #[instrument(skip_all, fields(class_id = %class_id), err)]
    async fn get_class_capacity(
        &self,
        class_id: ClassId,
    ) -> Result<Option<ClassCapacity>, PersistenceError> {
        let row = sqlx::query("SELECT capacity, current_enrollment FROM classes WHERE id = $1")
            .bind(Uuid::from(class_id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_class_capacity", e))?;

        row.map(|row| capacity_from_row("get_class_capacity", &row))
            .transpose()
    }
}

#[async_trait]
impl ClassRoster for PostgresEnrollmentStore {
    #[instrument(skip_all, fields(class_id = %class_id), err)]
    async fn recount_enrollment(&self, class_id: ClassId) -> Result<ClassCapacity, PersistenceError> {
        let row = sqlx::query(
            r#"
            UPDATE classes
            SET current_enrollment = (
                    SELECT COUNT(*) FROM enrollments
                    WHERE class_id = $1 AND status = 'active'
                ),
                updated_at = NOW()
            WHERE id = $1
            RETURNING capacity, current_enrollment
            "#,
        )
        .bind(Uuid::from(class_id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recount_enrollment", e))?
        .ok_or_else(|| PersistenceError::not_found("class", class_id))?;

        capacity_from_row("recount_enrollment", &row)
    }
}

#[async_trait]
impl EnrollmentRequestStore for PostgresEnrollmentStore {
    #[instrument(skip(self), err)]
    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnrollmentRequest>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, class_id, student_id, status, created_at, expires_at
            FROM enrollment_requests
            WHERE status = 'pending' AND expires_at < $1
            ORDER BY expires_at ASC, id ASC
            "#,
        )
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expired_enrollment_requests", e))?;

        rows.iter()
            .map(|row| -> Result<EnrollmentRequest, PersistenceError> {
                EnrollmentRequestRow::from_row(row)
                    .map_err(|e| map_sqlx_error("expired_enrollment_requests", e))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip_all, fields(request_id = %id), err)]
    async fn mark_expired(&self, id: EnrollmentRequestId) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            "UPDATE enrollment_requests SET status = 'expired' WHERE id = $1 AND status = 'pending'",
        )
        .bind(Uuid::from(id))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expire_enrollment_request", e))?;

        Ok(result.rows_affected() > 0)
    }
}

struct EnrollmentRequestRow {
    id: Uuid,
    class_id: Uuid,
    student_id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for EnrollmentRequestRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EnrollmentRequestRow {
            id: row.try_get("id")?,
            class_id: row.try_get("class_id")?,
            student_id: row.try_get("student_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl TryFrom<EnrollmentRequestRow> for EnrollmentRequest {
    type Error = PersistenceError;

    fn try_from(row: EnrollmentRequestRow) -> Result<Self, Self::Error> {
        Ok(EnrollmentRequest {
            id: EnrollmentRequestId::from_uuid(row.id),
            class_id: ClassId::from_uuid(row.class_id),
            student_id: StudentId::from_uuid(row.student_id),
            status: row.status.parse()?,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}
