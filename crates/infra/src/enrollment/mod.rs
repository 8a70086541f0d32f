//! Class capacity, enrollment counts and enrollment requests.
//!
//! Enrollment CRUD lives outside this crate. The waitlist and cleanup jobs only need
//! the narrow read/write contracts below.

mod postgres;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rollcall_core::{ClassId, EnrollmentRequestId, StudentId};

use crate::error::{PersistenceError, poisoned};

pub use postgres::PostgresEnrollmentStore;

/// Capacity snapshot of one class. Computed fresh, never cached across a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCapacity {
    pub capacity: i64,
    pub current_enrollment: i64,
}

impl ClassCapacity {
    pub fn new(capacity: i64, current_enrollment: i64) -> Self {
        Self {
            capacity,
            current_enrollment,
        }
    }

    /// `capacity - current_enrollment`; negative when over-enrolled.
    pub fn available_spots(&self) -> i64 {
        self.capacity - self.current_enrollment
    }
}

/// Read side of class capacity.
#[async_trait]
pub trait ClassCapacityReader: Send + Sync {
    /// `None` if the class does not exist.
    async fn get_class_capacity(
        &self,
        class_id: ClassId,
    ) -> Result<Option<ClassCapacity>, PersistenceError>;
}

/// Keeps a class's cached enrollment count in line with its roster.
#[async_trait]
pub trait ClassRoster: Send + Sync {
    /// Recount active enrollments, persist the count and return the new snapshot.
    async fn recount_enrollment(&self, class_id: ClassId) -> Result<ClassCapacity, PersistenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentRequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl EnrollmentRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentRequestStatus::Pending => "pending",
            EnrollmentRequestStatus::Approved => "approved",
            EnrollmentRequestStatus::Rejected => "rejected",
            EnrollmentRequestStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for EnrollmentRequestStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(PersistenceError::Rejected(format!(
                "unknown enrollment request status: {other}"
            ))),
        }
    }
}

/// A student's request to join a class, awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    pub id: EnrollmentRequestId,
    pub class_id: ClassId,
    pub student_id: StudentId,
    pub status: EnrollmentRequestStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EnrollmentRequest {
    pub fn pending(
        class_id: ClassId,
        student_id: StudentId,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: EnrollmentRequestId::new(),
            class_id,
            student_id,
            status: EnrollmentRequestStatus::Pending,
            created_at,
            expires_at,
        }
    }

    /// Pending with a deadline strictly before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentRequestStatus::Pending
            && self.expires_at.is_some_and(|at| at < now)
    }
}

/// Enrollment requests as seen by the cleanup job.
#[async_trait]
pub trait EnrollmentRequestStore: Send + Sync {
    /// Pending requests whose `expires_at` is before `now`.
    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnrollmentRequest>, PersistenceError>;

    /// `pending -> expired`. Returns `false` if the request was no longer pending.
    async fn mark_expired(&self, id: EnrollmentRequestId) -> Result<bool, PersistenceError>;
}

#[derive(Debug, Clone, Default)]
struct ClassRecord {
    capacity: i64,
    current_enrollment: i64,
    roster: HashSet<StudentId>,
}

/// In-memory classes, rosters and enrollment requests.
///
/// Intended for tests/dev. The cached `current_enrollment` only changes through
/// `set_current_enrollment` or `recount_enrollment`, as in the database.
#[derive(Debug, Default)]
pub struct InMemoryEnrollmentStore {
    classes: RwLock<HashMap<ClassId, ClassRecord>>,
    requests: RwLock<HashMap<EnrollmentRequestId, EnrollmentRequest>>,
}

impl InMemoryEnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create or resize a class.
    pub fn upsert_class(&self, class_id: ClassId, capacity: i64) -> Result<(), PersistenceError> {
        let mut classes = self.classes.write().map_err(poisoned)?;
        classes.entry(class_id).or_default().capacity = capacity;
        Ok(())
    }

    pub fn set_current_enrollment(
        &self,
        class_id: ClassId,
        current_enrollment: i64,
    ) -> Result<(), PersistenceError> {
        let mut classes = self.classes.write().map_err(poisoned)?;
        let class = classes
            .get_mut(&class_id)
            .ok_or_else(|| PersistenceError::not_found("class", class_id))?;
        class.current_enrollment = current_enrollment;
        Ok(())
    }

    /// Add a student to the roster.
    pub fn enroll(&self, class_id: ClassId, student_id: StudentId) -> Result<(), PersistenceError> {
        let mut classes = self.classes.write().map_err(poisoned)?;
        let class = classes
            .get_mut(&class_id)
            .ok_or_else(|| PersistenceError::not_found("class", class_id))?;
        class.roster.insert(student_id);
        Ok(())
    }

    /// Remove a student from the roster.
    pub fn withdraw(&self, class_id: ClassId, student_id: StudentId) -> Result<bool, PersistenceError> {
        let mut classes = self.classes.write().map_err(poisoned)?;
        Ok(classes
            .get_mut(&class_id)
            .is_some_and(|class| class.roster.remove(&student_id)))
    }

    pub fn add_request(&self, request: EnrollmentRequest) -> Result<(), PersistenceError> {
        let mut requests = self.requests.write().map_err(poisoned)?;
        requests.insert(request.id, request);
        Ok(())
    }

    pub fn request(&self, id: EnrollmentRequestId) -> Option<EnrollmentRequest> {
        self.requests.read().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl ClassCapacityReader for InMemoryEnrollmentStore {
    async fn get_class_capacity(
        &self,
        class_id: ClassId,
    ) -> Result<Option<ClassCapacity>, PersistenceError> {
        let classes = self.classes.read().map_err(poisoned)?;
        Ok(classes
            .get(&class_id)
            .map(|c| ClassCapacity::new(c.capacity, c.current_enrollment)))
    }
}

#[async_trait]
impl ClassRoster for InMemoryEnrollmentStore {
    async fn recount_enrollment(&self, class_id: ClassId) -> Result<ClassCapacity, PersistenceError> {
        let mut classes = self.classes.write().map_err(poisoned)?;
        let class = classes
            .get_mut(&class_id)
            .ok_or_else(|| PersistenceError::not_found("class", class_id))?;
        class.current_enrollment = class.roster.len() as i64;
        Ok(ClassCapacity::new(class.capacity, class.current_enrollment))
    }
}

#[async_trait]
impl EnrollmentRequestStore for InMemoryEnrollmentStore {
    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnrollmentRequest>, PersistenceError> {
        let requests = self.requests.read().map_err(poisoned)?;
        let mut expired: Vec<_> = requests
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| (r.expires_at, r.id));
        Ok(expired)
    }

    async fn mark_expired(&self, id: EnrollmentRequestId) -> Result<bool, PersistenceError> {
        let mut requests = self.requests.write().map_err(poisoned)?;
        match requests.get_mut(&id) {
            Some(r) if r.status == EnrollmentRequestStatus::Pending => {
                r.status = EnrollmentRequestStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn available_spots_can_be_negative() {
        assert_eq!(ClassCapacity::new(30, 28).available_spots(), 2);
        assert_eq!(ClassCapacity::new(30, 30).available_spots(), 0);
        assert_eq!(ClassCapacity::new(30, 31).available_spots(), -1);
    }

    #[tokio::test]
    async fn recount_follows_the_roster() {
        let store = InMemoryEnrollmentStore::new();
        let class_id = ClassId::new();
        store.upsert_class(class_id, 2).unwrap();
        store.set_current_enrollment(class_id, 2).unwrap();
        store.enroll(class_id, StudentId::new()).unwrap();

        let snapshot = store.recount_enrollment(class_id).await.unwrap();
        assert_eq!(snapshot, ClassCapacity::new(2, 1));
        assert_eq!(
            store.get_class_capacity(class_id).await.unwrap(),
            Some(ClassCapacity::new(2, 1))
        );

        let err = store.recount_enrollment(ClassId::new()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { entity: "class", .. }));
    }

    #[tokio::test]
    async fn only_overdue_pending_requests_expire() {
        let store = InMemoryEnrollmentStore::new();
        let class_id = ClassId::new();
        let now = Utc::now();

        let overdue = EnrollmentRequest::pending(class_id, StudentId::new(), now, Some(now - Duration::minutes(1)));
        let fresh = EnrollmentRequest::pending(class_id, StudentId::new(), now, Some(now + Duration::hours(1)));
        let open_ended = EnrollmentRequest::pending(class_id, StudentId::new(), now, None);
        let mut approved = EnrollmentRequest::pending(class_id, StudentId::new(), now, Some(now - Duration::hours(1)));
        approved.status = EnrollmentRequestStatus::Approved;

        for r in [&overdue, &fresh, &open_ended, &approved] {
            store.add_request(r.clone()).unwrap();
        }

        let expired = store.expired_pending(now).await.unwrap();
        assert_eq!(expired.iter().map(|r| r.id).collect::<Vec<_>>(), vec![overdue.id]);

        assert!(store.mark_expired(overdue.id).await.unwrap());
        assert!(!store.mark_expired(overdue.id).await.unwrap());
        assert_eq!(
            store.request(overdue.id).unwrap().status,
            EnrollmentRequestStatus::Expired
        );
        assert!(store.expired_pending(now).await.unwrap().is_empty());
    }
}
