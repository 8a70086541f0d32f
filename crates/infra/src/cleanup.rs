//! Periodic sweep of expired enrollment requests and waitlist offers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use rollcall_core::{ClassId, EnrollmentRequestId, WaitlistEntryId};

use crate::enrollment::EnrollmentRequestStore;
use crate::error::{HandlerError, PersistenceError};
use crate::jobs::payload::{CleanupExpiredRequests, JobPayload, ProcessWaitlist, SendNotification};
use crate::jobs::registry::JobHandler;
use crate::jobs::store::{JobStore, JobStoreExt};
use crate::jobs::types::EnqueueOptions;
use crate::notifications::NotificationType;
use crate::waitlist::WaitlistStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub expired_requests: Vec<EnrollmentRequestId>,
    pub expired_offers: Vec<WaitlistEntryId>,
    /// Classes that got a fresh `process_waitlist` job, once each.
    pub reprocessed_classes: Vec<ClassId>,
}

/// Handler for `cleanup_expired_requests` jobs.
///
/// - Pending requests past `expires_at` become `expired`, and the student is told.
/// - Expired offers are deleted, and each affected class is queued for promotion again
///   so the spot goes to the next student.
pub struct CleanupHandler {
    requests: Arc<dyn EnrollmentRequestStore>,
    waitlist: Arc<dyn WaitlistStore>,
    jobs: Arc<dyn JobStore>,
}

impl CleanupHandler {
    pub fn new(
        requests: Arc<dyn EnrollmentRequestStore>,
        waitlist: Arc<dyn WaitlistStore>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            requests,
            waitlist,
            jobs,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<CleanupOutcome, PersistenceError> {
        let mut outcome = CleanupOutcome::default();

        for request in self.requests.expired_pending(now).await? {
            // Approved or rejected since the read: leave it alone.
            if !self.requests.mark_expired(request.id).await? {
                debug!(request_id = %request.id, "enrollment request no longer pending, skipping");
                continue;
            }

            let notification = SendNotification {
                student_id: request.student_id,
                notification_type: NotificationType::EnrollmentRequestExpired,
                data: json!({
                    "request_id": request.id,
                    "class_id": request.class_id,
                    "expired_at": request.expires_at,
                }),
            };
            self.jobs
                .enqueue_payload(&notification, EnqueueOptions::default())
                .await?;
            outcome.expired_requests.push(request.id);
        }

        for entry in self.waitlist.expired_offers(now).await? {
            if !self.waitlist.remove(entry.id).await? {
                debug!(entry_id = %entry.id, "waitlist entry already removed, skipping");
                continue;
            }
            outcome.expired_offers.push(entry.id);
            if !outcome.reprocessed_classes.contains(&entry.class_id) {
                outcome.reprocessed_classes.push(entry.class_id);
            }
        }

        for &class_id in &outcome.reprocessed_classes {
            self.jobs
                .enqueue_payload(&ProcessWaitlist { class_id }, EnqueueOptions::default())
                .await?;
        }

        if !outcome.expired_requests.is_empty() || !outcome.expired_offers.is_empty() {
            info!(
                expired_requests = outcome.expired_requests.len(),
                expired_offers = outcome.expired_offers.len(),
                reprocessed_classes = outcome.reprocessed_classes.len(),
                "cleanup completed"
            );
        }
        Ok(outcome)
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError> {
        CleanupExpiredRequests::decode(payload)?;
        self.run(Utc::now()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use rollcall_core::StudentId;

    use crate::enrollment::{EnrollmentRequest, EnrollmentRequestStatus, InMemoryEnrollmentStore};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobKind;
    use crate::waitlist::{InMemoryWaitlistStore, WaitlistEntry};

    struct Fixture {
        requests: Arc<InMemoryEnrollmentStore>,
        waitlist: Arc<InMemoryWaitlistStore>,
        jobs: Arc<InMemoryJobStore>,
        handler: CleanupHandler,
    }

    fn fixture() -> Fixture {
        let requests = InMemoryEnrollmentStore::arc();
        let waitlist = InMemoryWaitlistStore::arc();
        let jobs = InMemoryJobStore::arc();
        let handler = CleanupHandler::new(requests.clone(), waitlist.clone(), jobs.clone());
        Fixture {
            requests,
            waitlist,
            jobs,
            handler,
        }
    }

    async fn offered_entry(f: &Fixture, class_id: ClassId, expires_at: DateTime<Utc>) -> WaitlistEntry {
        let entry = WaitlistEntry::new(class_id, StudentId::new(), 0, expires_at - Duration::days(2));
        f.waitlist.insert(entry.clone()).await.unwrap();
        f.waitlist
            .mark_offered(entry.id, expires_at - Duration::hours(24), expires_at)
            .await
            .unwrap();
        entry
    }

    #[tokio::test]
    async fn expired_offer_is_removed_and_class_requeued_once() {
        let f = fixture();
        let now = Utc::now();
        let class_a = ClassId::new();
        let class_b = ClassId::new();

        let a1 = offered_entry(&f, class_a, now - Duration::minutes(5)).await;
        let a2 = offered_entry(&f, class_a, now - Duration::minutes(1)).await;
        let live = offered_entry(&f, class_b, now + Duration::hours(3)).await;

        let outcome = f.handler.run(now).await.unwrap();

        assert_eq!(outcome.expired_offers, vec![a1.id, a2.id]);
        assert_eq!(outcome.reprocessed_classes, vec![class_a]);
        assert!(f.waitlist.get(a1.id).await.unwrap().is_none());
        assert!(f.waitlist.get(live.id).await.unwrap().is_some());

        let requeued = f.jobs.jobs_of_kind(JobKind::ProcessWaitlist);
        assert_eq!(requeued.len(), 1);
        assert_eq!(
            ProcessWaitlist::decode(&requeued[0].payload).unwrap().class_id,
            class_a
        );

        // Nothing left to do on the next sweep.
        let again = f.handler.run(now).await.unwrap();
        assert_eq!(again, CleanupOutcome::default());
        assert_eq!(f.jobs.jobs_of_kind(JobKind::ProcessWaitlist).len(), 1);
    }

    #[tokio::test]
    async fn expired_request_is_marked_and_student_notified() {
        let f = fixture();
        let now = Utc::now();
        let class_id = ClassId::new();
        let overdue = EnrollmentRequest::pending(class_id, StudentId::new(), now - Duration::days(3), Some(now - Duration::hours(1)));
        let fresh = EnrollmentRequest::pending(class_id, StudentId::new(), now, Some(now + Duration::days(1)));
        f.requests.add_request(overdue.clone()).unwrap();
        f.requests.add_request(fresh.clone()).unwrap();

        let outcome = f.handler.run(now).await.unwrap();

        assert_eq!(outcome.expired_requests, vec![overdue.id]);
        assert_eq!(
            f.requests.request(overdue.id).unwrap().status,
            EnrollmentRequestStatus::Expired
        );
        assert_eq!(
            f.requests.request(fresh.id).unwrap().status,
            EnrollmentRequestStatus::Pending
        );

        let sent = f.jobs.jobs_of_kind(JobKind::SendNotification);
        assert_eq!(sent.len(), 1);
        let notification = SendNotification::decode(&sent[0].payload).unwrap();
        assert_eq!(notification.student_id, overdue.student_id);
        assert_eq!(notification.notification_type, NotificationType::EnrollmentRequestExpired);
        assert_eq!(notification.data["request_id"], json!(overdue.id));

        // No offers expired, so no promotion was queued.
        assert!(f.jobs.jobs_of_kind(JobKind::ProcessWaitlist).is_empty());
    }

    #[tokio::test]
    async fn handler_accepts_empty_payload() {
        let f = fixture();
        let class_id = ClassId::new();
        offered_entry(&f, class_id, Utc::now() - Duration::seconds(1)).await;

        f.handler.handle(&json!({})).await.unwrap();

        assert_eq!(f.jobs.jobs_of_kind(JobKind::ProcessWaitlist).len(), 1);
    }
}
