//! Class statistics upkeep.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use rollcall_core::ClassId;

use crate::enrollment::{ClassCapacity, ClassRoster};
use crate::error::{HandlerError, PersistenceError};
use crate::jobs::payload::{JobPayload, ProcessWaitlist, UpdateClassStatistics};
use crate::jobs::registry::JobHandler;
use crate::jobs::store::{JobStore, JobStoreExt};
use crate::jobs::types::EnqueueOptions;

/// Handler for `update_class_statistics` jobs.
///
/// Recounts the roster; when that frees spots, queues `process_waitlist` for the class.
pub struct ClassStatisticsHandler {
    roster: Arc<dyn ClassRoster>,
    jobs: Arc<dyn JobStore>,
}

impl ClassStatisticsHandler {
    pub fn new(roster: Arc<dyn ClassRoster>, jobs: Arc<dyn JobStore>) -> Self {
        Self { roster, jobs }
    }

    pub async fn refresh(&self, class_id: ClassId) -> Result<ClassCapacity, PersistenceError> {
        let snapshot = self.roster.recount_enrollment(class_id).await?;

        if snapshot.available_spots() > 0 {
            self.jobs
                .enqueue_payload(&ProcessWaitlist { class_id }, EnqueueOptions::default())
                .await?;
        }

        info!(
            class_id = %class_id,
            capacity = snapshot.capacity,
            current_enrollment = snapshot.current_enrollment,
            "class statistics updated"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl JobHandler for ClassStatisticsHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError> {
        let job = UpdateClassStatistics::decode(payload)?;
        self.refresh(job.class_id).await?;
        Ok(())
    }
}
