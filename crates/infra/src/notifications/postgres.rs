//! Postgres-backed notification dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use rollcall_core::StudentId;

use crate::error::{DispatchError, map_sqlx_error};

use super::{NotificationDispatcher, NotificationType};

/// Records notifications in the `notifications` table for the delivery service to pick
/// up.
#[derive(Debug, Clone)]
pub struct PostgresNotificationDispatcher {
    pool: Arc<PgPool>,
}

impl PostgresNotificationDispatcher {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for PostgresNotificationDispatcher {
    #[instrument(skip_all, fields(student_id = %student_id, notification_type = %notification_type), err)]
    async fn notify(
        &self,
        student_id: StudentId,
        notification_type: NotificationType,
        data: &serde_json::Value,
    ) -> Result<(), DispatchError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, student_id, notification_type, payload, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(Uuid::from(student_id))
        .bind(notification_type.as_str())
        .bind(data)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_notification", e))?;

        Ok(())
    }
}
