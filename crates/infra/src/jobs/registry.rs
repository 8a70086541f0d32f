//! Fixed mapping from job kind to handler.
//!
//! The registry is assembled once at startup and validated there: every `JobKind`
//! must have exactly one handler, and one handler instance may not serve two kinds.
//! After `build()` succeeds, dispatch cannot fail to find a handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::HandlerError;

use super::types::JobKind;

/// Executes jobs of one kind.
///
/// Handlers run at least once per job and must be idempotent. They may enqueue
/// follow-up jobs.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError>;
}

/// Registry construction error. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no handler registered for job kinds: {}", join_kinds(.0))]
    MissingHandlers(Vec<JobKind>),

    #[error("handler for {0} registered twice")]
    DuplicateKind(JobKind),

    #[error("job kinds {first} and {second} share one handler instance")]
    SharedHandler { first: JobKind, second: JobKind },
}

fn join_kinds(kinds: &[JobKind]) -> String {
    kinds
        .iter()
        .map(JobKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validated kind → handler table.
#[derive(Clone)]
pub struct HandlerRegistry {
    process_waitlist: Arc<dyn JobHandler>,
    cleanup_expired_requests: Arc<dyn JobHandler>,
    send_notification: Arc<dyn JobHandler>,
    update_class_statistics: Arc<dyn JobHandler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &JobKind::ALL)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Handler for a kind. Total by construction.
    pub fn handler(&self, kind: JobKind) -> Arc<dyn JobHandler> {
        match kind {
            JobKind::ProcessWaitlist => self.process_waitlist.clone(),
            JobKind::CleanupExpiredRequests => self.cleanup_expired_requests.clone(),
            JobKind::SendNotification => self.send_notification.clone(),
            JobKind::UpdateClassStatistics => self.update_class_statistics.clone(),
        }
    }
}

/// Collects handlers; `build()` validates completeness.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register the handler for a kind.
    pub fn register(
        mut self,
        kind: JobKind,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateKind(kind));
        }

        let instance = Arc::as_ptr(&handler) as *const ();
        if let Some((&first, _)) = self
            .handlers
            .iter()
            .find(|(_, existing)| Arc::as_ptr(existing) as *const () == instance)
        {
            return Err(RegistryError::SharedHandler {
                first,
                second: kind,
            });
        }

        self.handlers.insert(kind, handler);
        Ok(self)
    }

    pub fn build(mut self) -> Result<HandlerRegistry, RegistryError> {
        let missing: Vec<JobKind> = JobKind::ALL
            .into_iter()
            .filter(|k| !self.handlers.contains_key(k))
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingHandlers(missing));
        }

        let mut take = |kind: JobKind| {
            self.handlers
                .remove(&kind)
                .ok_or(RegistryError::MissingHandlers(vec![kind]))
        };

        Ok(HandlerRegistry {
            process_waitlist: take(JobKind::ProcessWaitlist)?,
            cleanup_expired_requests: take(JobKind::CleanupExpiredRequests)?,
            send_notification: take(JobKind::SendNotification)?,
            update_class_statistics: take(JobKind::UpdateClassStatistics)?,
        })
    }
}
