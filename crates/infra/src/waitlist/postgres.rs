//! Postgres-backed waitlist store over `waitlist_entries`.
//!
//! Offer stamping is a conditional update (`notified_at IS NULL`), so an entry never
//! receives two overlapping offers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use rollcall_core::{ClassId, StudentId, WaitlistEntryId};

use crate::error::{PersistenceError, map_sqlx_error};

use super::{WaitlistEntry, WaitlistStore};

const ENTRY_COLUMNS: &str = "id, class_id, student_id, priority, added_at, notified_at, expires_at";

#[derive(Debug, Clone)]
pub struct PostgresWaitlistStore {
    pool: Arc<PgPool>,
}

impl PostgresWaitlistStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn decode_rows(operation: &str, rows: &[PgRow]) -> Result<Vec<WaitlistEntry>, PersistenceError> {
        rows.iter()
            .map(|row| {
                WaitlistEntryRow::from_row(row)
                    .map(WaitlistEntry::from)
                    .map_err(|e| map_sqlx_error(operation, e))
            })
            .collect()
    }
}

#[async_trait]
impl WaitlistStore for PostgresWaitlistStore {
    #[instrument(skip_all, fields(entry_id = %entry.id, class_id = %entry.class_id), err)]
    async fn insert(&self, entry: WaitlistEntry) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO waitlist_entries (
                id, class_id, student_id, priority, added_at, notified_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::from(entry.id))
        .bind(Uuid::from(entry.class_id))
        .bind(Uuid::from(entry.student_id))
        .bind(entry.priority)
        .bind(entry.added_at)
        .bind(entry.notified_at)
        .bind(entry.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_waitlist_entry", e))?;

        Ok(())
    }

    #[instrument(skip_all, fields(entry_id = %id), err)]
    async fn get(&self, id: WaitlistEntryId) -> Result<Option<WaitlistEntry>, PersistenceError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_waitlist_entry", e))?;

        row.map(|row| {
            WaitlistEntryRow::from_row(&row)
                .map(WaitlistEntry::from)
                .map_err(|e| map_sqlx_error("get_waitlist_entry", e))
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn candidates(
        &self,
        class_id: ClassId,
        limit: usize,
    ) -> Result<Vec<WaitlistEntry>, PersistenceError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM waitlist_entries \
             WHERE class_id = $1 AND notified_at IS NULL \
             ORDER BY priority DESC, added_at ASC, id ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(Uuid::from(class_id))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("waitlist_candidates", e))?;

        Self::decode_rows("waitlist_candidates", &rows)
    }

    #[instrument(skip(self), err)]
    async fn outstanding_offers(&self, class_id: ClassId) -> Result<usize, PersistenceError> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM waitlist_entries WHERE class_id = $1 AND notified_at IS NOT NULL",
        )
        .bind(Uuid::from(class_id))
        .fetch_one(&*self.pool)
        .await
        .and_then(|row| row.try_get("n"))
        .map_err(|e| map_sqlx_error("outstanding_offers", e))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    #[instrument(skip_all, fields(entry_id = %id), err)]
    async fn mark_offered(
        &self,
        id: WaitlistEntryId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE waitlist_entries
            SET notified_at = $2, expires_at = $3
            WHERE id = $1 AND notified_at IS NULL
            "#,
        )
        .bind(Uuid::from(id))
        .bind(notified_at)
        .bind(expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_offered", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn expired_offers(&self, now: DateTime<Utc>) -> Result<Vec<WaitlistEntry>, PersistenceError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM waitlist_entries \
             WHERE expires_at IS NOT NULL AND expires_at < $1 \
             ORDER BY expires_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("expired_offers", e))?;

        Self::decode_rows("expired_offers", &rows)
    }

    #[instrument(skip_all, fields(entry_id = %id), err)]
    async fn remove(&self, id: WaitlistEntryId) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM waitlist_entries WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_waitlist_entry", e))?;

        Ok(result.rows_affected() > 0)
    }
}

struct WaitlistEntryRow {
    id: Uuid,
    class_id: Uuid,
    student_id: Uuid,
    priority: i32,
    added_at: DateTime<Utc>,
    notified_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for WaitlistEntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(WaitlistEntryRow {
            id: row.try_get("id")?,
            class_id: row.try_get("class_id")?,
            student_id: row.try_get("student_id")?,
            priority: row.try_get("priority")?,
            added_at: row.try_get("added_at")?,
            notified_at: row.try_get("notified_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl From<WaitlistEntryRow> for WaitlistEntry {
    fn from(row: WaitlistEntryRow) -> Self {
        WaitlistEntry {
            id: WaitlistEntryId::from_uuid(row.id),
            class_id: ClassId::from_uuid(row.class_id),
            student_id: StudentId::from_uuid(row.student_id),
            priority: row.priority,
            added_at: row.added_at,
            notified_at: row.notified_at,
            expires_at: row.expires_at,
        }
    }
}
