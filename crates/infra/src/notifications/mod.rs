//! Notification dispatch adapter.
//!
//! Delivery (email, push) happens elsewhere. This crate only records the notification
//! and hands it to a `NotificationDispatcher`; the `send_notification` job is the
//! single caller.

mod postgres;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use rollcall_core::StudentId;

use crate::error::{DispatchError, HandlerError, poisoned};
use crate::jobs::payload::{JobPayload, SendNotification};
use crate::jobs::registry::JobHandler;

pub use postgres::PostgresNotificationDispatcher;

/// What the student is being told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// A waitlist spot opened and is held for the student until the offer expires.
    WaitlistEnrollmentAvailable,
    /// A pending enrollment request expired unanswered.
    EnrollmentRequestExpired,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::WaitlistEnrollmentAvailable => "waitlist_enrollment_available",
            NotificationType::EnrollmentRequestExpired => "enrollment_request_expired",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records and delivers a notification.
///
/// Must be idempotent from the caller's point of view: a retried job may call
/// `notify` again with the same arguments.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(
        &self,
        student_id: StudentId,
        notification_type: NotificationType,
        data: &serde_json::Value,
    ) -> Result<(), DispatchError>;
}

/// A notification as handed to a dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentNotification {
    pub student_id: StudentId,
    pub notification_type: NotificationType,
    pub data: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// Keeps every notification in memory.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotificationDispatcher {
    sent: RwLock<Vec<SentNotification>>,
}

impl InMemoryNotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, student_id: StudentId) -> Vec<SentNotification> {
        self.sent()
            .into_iter()
            .filter(|n| n.student_id == student_id)
            .collect()
    }
}

#[async_trait]
impl NotificationDispatcher for InMemoryNotificationDispatcher {
    async fn notify(
        &self,
        student_id: StudentId,
        notification_type: NotificationType,
        data: &serde_json::Value,
    ) -> Result<(), DispatchError> {
        let mut sent = self.sent.write().map_err(poisoned)?;
        sent.push(SentNotification {
            student_id,
            notification_type,
            data: data.clone(),
            sent_at: Utc::now(),
        });
        Ok(())
    }
}

/// Emits one structured log line per notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LoggingNotificationDispatcher {
    async fn notify(
        &self,
        student_id: StudentId,
        notification_type: NotificationType,
        data: &serde_json::Value,
    ) -> Result<(), DispatchError> {
        info!(
            student_id = %student_id,
            notification_type = %notification_type,
            data = %data,
            "notification dispatched"
        );
        Ok(())
    }
}

/// Handler for `send_notification` jobs.
pub struct SendNotificationHandler {
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl SendNotificationHandler {
    pub fn new(dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobHandler for SendNotificationHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError> {
        let job = SendNotification::decode(payload)?;
        self.dispatcher
            .notify(job.student_id, job.notification_type, &job.data)
            .await?;
        Ok(())
    }
}
