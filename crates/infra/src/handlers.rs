//! Registry wiring: one handler per job kind over a shared set of stores.

use std::sync::Arc;

use crate::cleanup::CleanupHandler;
use crate::config::PromotionConfig;
use crate::enrollment::{ClassCapacityReader, ClassRoster, EnrollmentRequestStore};
use crate::jobs::registry::{HandlerRegistry, RegistryError};
use crate::jobs::store::JobStore;
use crate::jobs::types::JobKind;
use crate::notifications::{NotificationDispatcher, SendNotificationHandler};
use crate::stats::ClassStatisticsHandler;
use crate::waitlist::{ProcessWaitlistHandler, WaitlistPromoter, WaitlistStore};

/// Everything the handlers read from or write to.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobStore>,
    pub classes: Arc<dyn ClassCapacityReader>,
    pub roster: Arc<dyn ClassRoster>,
    pub requests: Arc<dyn EnrollmentRequestStore>,
    pub waitlist: Arc<dyn WaitlistStore>,
    pub notifications: Arc<dyn NotificationDispatcher>,
    pub promotion: PromotionConfig,
}

/// Build the full registry. Fails only on a wiring mistake.
pub fn build_registry(c: &Collaborators) -> Result<HandlerRegistry, RegistryError> {
    let promoter = WaitlistPromoter::new(
        c.classes.clone(),
        c.waitlist.clone(),
        c.jobs.clone(),
        c.promotion.clone(),
    );

    HandlerRegistry::builder()
        .register(
            JobKind::ProcessWaitlist,
            Arc::new(ProcessWaitlistHandler::new(Arc::new(promoter))),
        )?
        .register(
            JobKind::CleanupExpiredRequests,
            Arc::new(CleanupHandler::new(
                c.requests.clone(),
                c.waitlist.clone(),
                c.jobs.clone(),
            )),
        )?
        .register(
            JobKind::SendNotification,
            Arc::new(SendNotificationHandler::new(c.notifications.clone())),
        )?
        .register(
            JobKind::UpdateClassStatistics,
            Arc::new(ClassStatisticsHandler::new(c.roster.clone(), c.jobs.clone())),
        )?
        .build()
}
