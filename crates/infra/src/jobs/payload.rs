//! Typed payloads for each job kind.
//!
//! The store keeps payloads as opaque JSON; these types are how producers build them
//! and how handlers read them back.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use rollcall_core::{ClassId, StudentId};

use crate::error::HandlerError;
use crate::jobs::types::JobKind;
use crate::notifications::NotificationType;

/// A payload bound to exactly one job kind.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    const KIND: JobKind;

    fn decode(value: &serde_json::Value) -> Result<Self, HandlerError> {
        Self::deserialize(value).map_err(|e| HandlerError::InvalidPayload {
            kind: Self::KIND,
            message: e.to_string(),
        })
    }
}

/// `process_waitlist`: promote waitlisted students of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessWaitlist {
    pub class_id: ClassId,
}

impl JobPayload for ProcessWaitlist {
    const KIND: JobKind = JobKind::ProcessWaitlist;
}

/// `cleanup_expired_requests`: sweep everything that expired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupExpiredRequests {}

impl JobPayload for CleanupExpiredRequests {
    const KIND: JobKind = JobKind::CleanupExpiredRequests;
}

/// `send_notification`: record and deliver one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendNotification {
    pub student_id: StudentId,
    pub notification_type: NotificationType,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobPayload for SendNotification {
    const KIND: JobKind = JobKind::SendNotification;
}

/// `update_class_statistics`: recount a class's enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClassStatistics {
    pub class_id: ClassId,
}

impl JobPayload for UpdateClassStatistics {
    const KIND: JobKind = JobKind::UpdateClassStatistics;
}
