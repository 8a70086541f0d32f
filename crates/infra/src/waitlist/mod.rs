//! Class waitlists and time-boxed offers.
//!
//! An entry with `notified_at` set holds an outstanding offer; `expires_at` is set and
//! cleared together with it. Entries leave the list when the student accepts
//! (enrollment CRUD, outside this crate) or when cleanup retires an expired offer.

mod postgres;
pub mod promotion;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rollcall_core::{ClassId, StudentId, WaitlistEntryId};

use crate::error::{PersistenceError, poisoned};

pub use postgres::PostgresWaitlistStore;
pub use promotion::{ProcessWaitlistHandler, PromotionOutcome, WaitlistPromoter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: WaitlistEntryId,
    pub class_id: ClassId,
    pub student_id: StudentId,
    /// Higher is offered first.
    pub priority: i32,
    pub added_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl WaitlistEntry {
    pub fn new(
        class_id: ClassId,
        student_id: StudentId,
        priority: i32,
        added_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WaitlistEntryId::new(),
            class_id,
            student_id,
            priority,
            added_at,
            notified_at: None,
            expires_at: None,
        }
    }

    pub fn has_outstanding_offer(&self) -> bool {
        self.notified_at.is_some()
    }

    pub fn offer_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Offer order: priority desc, then first come first served.
pub fn rank_order(a: &WaitlistEntry, b: &WaitlistEntry) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.added_at.cmp(&b.added_at))
        .then(a.id.cmp(&b.id))
}

/// The next `limit` entries to offer, best first. Entries already holding an offer are
/// never selected.
pub fn select_candidates(entries: &[WaitlistEntry], limit: usize) -> Vec<WaitlistEntry> {
    let mut waiting: Vec<_> = entries
        .iter()
        .filter(|e| !e.has_outstanding_offer())
        .cloned()
        .collect();
    waiting.sort_by(rank_order);
    waiting.truncate(limit);
    waiting
}

#[async_trait]
pub trait WaitlistStore: Send + Sync {
    async fn insert(&self, entry: WaitlistEntry) -> Result<(), PersistenceError>;

    async fn get(&self, id: WaitlistEntryId) -> Result<Option<WaitlistEntry>, PersistenceError>;

    /// Up to `limit` entries of the class without an offer, in offer order.
    async fn candidates(
        &self,
        class_id: ClassId,
        limit: usize,
    ) -> Result<Vec<WaitlistEntry>, PersistenceError>;

    /// Entries of the class currently holding an offer.
    async fn outstanding_offers(&self, class_id: ClassId) -> Result<usize, PersistenceError>;

    /// Stamp an offer. Returns `false` if the entry is gone or already has one.
    async fn mark_offered(
        &self,
        id: WaitlistEntryId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Entries, across all classes, whose offer expired before `now`.
    async fn expired_offers(&self, now: DateTime<Utc>) -> Result<Vec<WaitlistEntry>, PersistenceError>;

    /// Returns `false` if the entry was already gone.
    async fn remove(&self, id: WaitlistEntryId) -> Result<bool, PersistenceError>;
}

/// In-memory waitlist store.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryWaitlistStore {
    entries: RwLock<HashMap<WaitlistEntryId, WaitlistEntry>>,
}

impl InMemoryWaitlistStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl WaitlistStore for InMemoryWaitlistStore {
    async fn insert(&self, entry: WaitlistEntry) -> Result<(), PersistenceError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        if entries
            .values()
            .any(|e| e.class_id == entry.class_id && e.student_id == entry.student_id)
        {
            return Err(PersistenceError::Rejected(format!(
                "student {} already waitlisted for class {}",
                entry.student_id, entry.class_id
            )));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: WaitlistEntryId) -> Result<Option<WaitlistEntry>, PersistenceError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(&id).cloned())
    }

    async fn candidates(
        &self,
        class_id: ClassId,
        limit: usize,
    ) -> Result<Vec<WaitlistEntry>, PersistenceError> {
        let entries = self.entries.read().map_err(poisoned)?;
        let of_class: Vec<_> = entries
            .values()
            .filter(|e| e.class_id == class_id)
            .cloned()
            .collect();
        Ok(select_candidates(&of_class, limit))
    }

    async fn outstanding_offers(&self, class_id: ClassId) -> Result<usize, PersistenceError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .values()
            .filter(|e| e.class_id == class_id && e.has_outstanding_offer())
            .count())
    }

    async fn mark_offered(
        &self,
        id: WaitlistEntryId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.get_mut(&id) {
            Some(entry) if !entry.has_outstanding_offer() => {
                entry.notified_at = Some(notified_at);
                entry.expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_offers(&self, now: DateTime<Utc>) -> Result<Vec<WaitlistEntry>, PersistenceError> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut expired: Vec<_> = entries
            .values()
            .filter(|e| e.offer_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|e| (e.expires_at, e.id));
        Ok(expired)
    }

    async fn remove(&self, id: WaitlistEntryId) -> Result<bool, PersistenceError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(entries.remove(&id).is_some())
    }
}
