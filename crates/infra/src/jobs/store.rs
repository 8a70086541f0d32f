//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{PersistenceError, poisoned};

use super::payload::JobPayload;
use super::types::{EnqueueOptions, Job, JobId, JobKind, JobStatus};

/// Job store abstraction.
///
/// Pure data access: insert, filtered select, update-by-id. Fetching never mutates;
/// claiming is a separate `mark_processing` call that only succeeds on a pending row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job. The payload is not inspected.
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, PersistenceError>;

    /// Pending jobs with `scheduled_at <= now`, highest priority first, then oldest
    /// `scheduled_at`, at most `limit`.
    async fn fetch_due(&self, limit: usize) -> Result<Vec<Job>, PersistenceError>;

    /// Claim a job: `pending -> processing`.
    ///
    /// Fails with `NotClaimable` if the job is no longer pending and `NotFound` if it
    /// no longer exists.
    async fn mark_processing(&self, id: JobId) -> Result<(), PersistenceError>;

    /// `processing -> completed`.
    async fn mark_completed(&self, id: JobId) -> Result<(), PersistenceError>;

    /// `processing -> failed`, recording the final attempt and its error.
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), PersistenceError>;

    /// `processing -> pending` with a new attempt count and run time.
    async fn reschedule(
        &self,
        id: JobId,
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PersistenceError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, PersistenceError>;

    /// List jobs in a status, oldest first.
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, PersistenceError>;

    /// Count jobs per status.
    async fn stats(&self) -> Result<JobStats, PersistenceError>;
}

/// Typed enqueue on top of any `JobStore`.
#[async_trait]
pub trait JobStoreExt: JobStore {
    async fn enqueue_payload<P: JobPayload>(
        &self,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<JobId, PersistenceError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        self.enqueue(P::KIND, value, options).await
    }
}

impl<T: JobStore + ?Sized> JobStoreExt for T {}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Sort key for due jobs: priority desc, scheduled_at asc, then insertion order.
fn due_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_at.cmp(&b.scheduled_at))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.0.cmp(&b.id.0))
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All jobs of one kind, oldest first.
    pub fn jobs_of_kind(&self, kind: JobKind) -> Vec<Job> {
        let jobs = match self.jobs.read() {
            Ok(jobs) => jobs,
            Err(_) => return Vec::new(),
        };
        let mut result: Vec<_> = jobs.values().filter(|j| j.kind == kind).cloned().collect();
        result.sort_by_key(|j| (j.created_at, j.id.0));
        result
    }

    fn update<F>(&self, id: JobId, f: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), PersistenceError>,
    {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::job_not_found(id))?;
        f(job, Utc::now())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, PersistenceError> {
        let job = Job::new(kind, payload, options, Utc::now());
        let id = job.id;
        self.jobs.write().map_err(poisoned)?.insert(id, job);
        Ok(id)
    }

    async fn fetch_due(&self, limit: usize) -> Result<Vec<Job>, PersistenceError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let now = Utc::now();

        let mut due: Vec<_> = jobs.values().filter(|j| j.is_due(now)).cloned().collect();
        due.sort_by(due_order);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_processing(&self, id: JobId) -> Result<(), PersistenceError> {
        self.update(id, |job, now| job.mark_processing(now))
    }

    async fn mark_completed(&self, id: JobId) -> Result<(), PersistenceError> {
        self.update(id, |job, now| job.mark_completed(now))
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), PersistenceError> {
        self.update(id, |job, now| job.mark_failed(error, now))
    }

    async fn reschedule(
        &self,
        id: JobId,
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PersistenceError> {
        self.update(id, |job, now| job.reschedule(attempts, scheduled_at, error, now))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, PersistenceError> {
        Ok(self.jobs.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, PersistenceError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.status == status).cloned().collect();

        result.sort_by_key(|j| (j.created_at, j.id.0));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, PersistenceError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::ProcessWaitlist;
    use rollcall_core::ClassId;

    #[tokio::test]
    async fn enqueue_then_fetch_returns_same_payload() {
        let store = InMemoryJobStore::new();
        let payload = serde_json::json!({
            "class_id": "0190c1d2-0000-7000-8000-000000000001",
            "nested": {"list": [1, 2, 3], "flag": true},
        });

        let id = store
            .enqueue(JobKind::ProcessWaitlist, payload.clone(), EnqueueOptions::default())
            .await
            .unwrap();

        let due = store.fetch_due(1).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].payload, payload);
        assert_eq!(due[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn fetch_due_orders_by_priority_then_schedule() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(30);

        let low = store
            .enqueue(
                JobKind::SendNotification,
                serde_json::json!({}),
                EnqueueOptions::default().scheduled_at(earlier),
            )
            .await
            .unwrap();
        let high_late = store
            .enqueue(
                JobKind::SendNotification,
                serde_json::json!({}),
                EnqueueOptions::default().with_priority(5).scheduled_at(now),
            )
            .await
            .unwrap();
        let high_early = store
            .enqueue(
                JobKind::SendNotification,
                serde_json::json!({}),
                EnqueueOptions::default().with_priority(5).scheduled_at(earlier),
            )
            .await
            .unwrap();
        let _future = store
            .enqueue(
                JobKind::SendNotification,
                serde_json::json!({}),
                EnqueueOptions::default()
                    .with_priority(100)
                    .scheduled_at(now + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        let due: Vec<_> = store
            .fetch_due(10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(due, vec![high_early, high_late, low]);

        let capped = store.fetch_due(2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn fetch_due_has_no_side_effects() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(JobKind::ProcessWaitlist, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        store.fetch_due(10).await.unwrap();
        store.fetch_due(10).await.unwrap();

        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryJobStore::new();
        let id = store
            .enqueue(JobKind::ProcessWaitlist, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        store.mark_processing(id).await.unwrap();
        let second = store.mark_processing(id).await.unwrap_err();
        assert!(matches!(
            second,
            PersistenceError::NotClaimable {
                status: JobStatus::Processing,
                ..
            }
        ));
        assert!(second.is_already_handled());

        // Claimed jobs are no longer due.
        assert!(store.fetch_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn updates_on_missing_rows_are_reported() {
        let store = InMemoryJobStore::new();
        let missing = JobId::new();

        let err = store.mark_completed(missing).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { .. }));
        assert!(err.is_already_handled());
        assert!(store.mark_failed(missing, "x").await.is_err());
        assert!(store.reschedule(missing, 1, Utc::now(), "x").await.is_err());
    }

    #[tokio::test]
    async fn reschedule_clamps_attempts() {
        let store = InMemoryJobStore::new();
        let id = store
            .enqueue(
                JobKind::ProcessWaitlist,
                serde_json::json!({}),
                EnqueueOptions::default().with_max_attempts(2),
            )
            .await
            .unwrap();

        store.mark_processing(id).await.unwrap();
        store.reschedule(id, 7, Utc::now(), "nope").await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn typed_enqueue_and_stats() {
        let store = InMemoryJobStore::arc();
        let class_id = ClassId::new();

        for _ in 0..3 {
            store
                .enqueue_payload(&ProcessWaitlist { class_id }, EnqueueOptions::default())
                .await
                .unwrap();
        }

        let jobs = store.jobs_of_kind(JobKind::ProcessWaitlist);
        assert_eq!(jobs.len(), 3);
        assert_eq!(
            ProcessWaitlist::decode(&jobs[0].payload).unwrap().class_id,
            class_id
        );

        store.mark_processing(jobs[0].id).await.unwrap();
        store.mark_processing(jobs[1].id).await.unwrap();
        store.mark_completed(jobs[1].id).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            JobStats {
                pending: 1,
                processing: 1,
                completed: 1,
                failed: 0,
            }
        );
        assert_eq!(
            store.list_by_status(JobStatus::Completed, 10).await.unwrap()[0].id,
            jobs[1].id
        );
    }
}
