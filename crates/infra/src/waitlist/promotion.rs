//! Turns free class capacity into waitlist offers.
//!
//! A run reads a fresh capacity snapshot, subtracts offers still outstanding, and
//! offers the remaining spots to the best-ranked waiting entries. Each offer is a
//! stamp on the entry (`notified_at`, `expires_at`) plus a `send_notification` job.
//! The stamp comes first and only a won stamp is notified. If the enqueue then fails,
//! the run is retried and the stamped offer, never announced, expires and is
//! cascaded by cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use rollcall_core::{ClassId, WaitlistEntryId};

use crate::config::PromotionConfig;
use crate::enrollment::ClassCapacityReader;
use crate::error::{HandlerError, PersistenceError};
use crate::jobs::payload::{JobPayload, ProcessWaitlist, SendNotification};
use crate::jobs::registry::JobHandler;
use crate::jobs::store::{JobStore, JobStoreExt};
use crate::jobs::types::EnqueueOptions;
use crate::notifications::NotificationType;

use super::WaitlistStore;

/// Result of one promotion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionOutcome {
    /// `capacity - current_enrollment` at the time of the run.
    pub available_spots: i64,
    /// Offers already outstanding before the run.
    pub outstanding_offers: usize,
    /// Entries offered in this run, in offer order.
    pub offered: Vec<WaitlistEntryId>,
}

pub struct WaitlistPromoter {
    classes: Arc<dyn ClassCapacityReader>,
    waitlist: Arc<dyn WaitlistStore>,
    jobs: Arc<dyn JobStore>,
    config: PromotionConfig,
}

impl WaitlistPromoter {
    pub fn new(
        classes: Arc<dyn ClassCapacityReader>,
        waitlist: Arc<dyn WaitlistStore>,
        jobs: Arc<dyn JobStore>,
        config: PromotionConfig,
    ) -> Self {
        Self {
            classes,
            waitlist,
            jobs,
            config,
        }
    }

    /// Offer open spots of `class_id` to waitlisted students.
    ///
    /// Never leaves more outstanding offers than `available_spots`.
    pub async fn promote(
        &self,
        class_id: ClassId,
        now: DateTime<Utc>,
    ) -> Result<PromotionOutcome, PersistenceError> {
        let Some(capacity) = self.classes.get_class_capacity(class_id).await? else {
            warn!(class_id = %class_id, "class not found, nothing to promote");
            return Ok(PromotionOutcome::default());
        };

        let available_spots = capacity.available_spots();
        let outstanding_offers = self.waitlist.outstanding_offers(class_id).await?;
        let mut outcome = PromotionOutcome {
            available_spots,
            outstanding_offers,
            offered: Vec::new(),
        };

        let open = available_spots - i64::try_from(outstanding_offers).unwrap_or(i64::MAX);
        if open <= 0 {
            debug!(
                class_id = %class_id,
                available_spots,
                outstanding_offers,
                "no open spots"
            );
            return Ok(outcome);
        }

        let limit = usize::try_from(open).unwrap_or(usize::MAX);
        let candidates = self.waitlist.candidates(class_id, limit).await?;
        let ttl = chrono::Duration::from_std(self.config.offer_ttl)
            .map_err(|e| PersistenceError::Rejected(format!("offer ttl out of range: {e}")))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| PersistenceError::Rejected("offer expiry out of range".to_string()))?;

        for entry in candidates.into_iter().take(limit) {
            if !self.waitlist.mark_offered(entry.id, now, expires_at).await? {
                debug!(entry_id = %entry.id, "waitlist entry already offered or removed, skipping");
                continue;
            }

            let notification = SendNotification {
                student_id: entry.student_id,
                notification_type: NotificationType::WaitlistEnrollmentAvailable,
                data: json!({
                    "class_id": class_id,
                    "waitlist_entry_id": entry.id,
                    "expires_at": expires_at,
                    "response_deadline_hours": self.config.response_deadline_hours(),
                }),
            };
            self.jobs
                .enqueue_payload(&notification, EnqueueOptions::default())
                .await?;
            outcome.offered.push(entry.id);
        }

        info!(
            class_id = %class_id,
            available_spots,
            outstanding_offers,
            offered = outcome.offered.len(),
            "waitlist processed"
        );
        Ok(outcome)
    }
}

/// Handler for `process_waitlist` jobs.
pub struct ProcessWaitlistHandler {
    promoter: Arc<WaitlistPromoter>,
}

impl ProcessWaitlistHandler {
    pub fn new(promoter: Arc<WaitlistPromoter>) -> Self {
        Self { promoter }
    }
}

#[async_trait]
impl JobHandler for ProcessWaitlistHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError> {
        let job = ProcessWaitlist::decode(payload)?;
        self.promoter.promote(job.class_id, Utc::now()).await?;
        Ok(())
    }
}
