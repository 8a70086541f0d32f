//! Core job types and the retry state machine.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PersistenceError;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job kind, used to route a job to its handler.
///
/// The set is closed: the registry must provide a handler for every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Convert free class capacity into waitlist offers.
    ProcessWaitlist,
    /// Retire expired enrollment requests and waitlist offers.
    CleanupExpiredRequests,
    /// Record and deliver a notification to a student.
    SendNotification,
    /// Recount a class's enrollment.
    UpdateClassStatistics,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ProcessWaitlist,
        JobKind::CleanupExpiredRequests,
        JobKind::SendNotification,
        JobKind::UpdateClassStatistics,
    ];

    /// Stable wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessWaitlist => "process_waitlist",
            JobKind::CleanupExpiredRequests => "cleanup_expired_requests",
            JobKind::SendNotification => "send_notification",
            JobKind::UpdateClassStatistics => "update_class_statistics",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PersistenceError::Rejected(format!("unknown job kind: {s}")))
    }
}

/// Job execution status.
///
/// Transitions: `Pending -> Processing -> {Completed | Pending (retry) | Failed}`.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for `scheduled_at`
    Pending,
    /// Claimed by the processor, handler running
    Processing,
    /// Completed successfully
    Completed,
    /// Exhausted its attempts
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Pending)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PersistenceError::Rejected(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Delay before the next run after the `attempt`-th failure (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What to do with a job whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending`, runnable again at `run_at`.
    Retry { attempts: u32, run_at: DateTime<Utc> },
    /// Attempts exhausted; the job goes to `failed`.
    Exhausted { attempts: u32 },
}

impl RetryDecision {
    /// Decide the next state after a failed execution.
    ///
    /// `attempts` is the count recorded before this execution.
    pub fn after_failure(
        attempts: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> Self {
        let max_attempts = max_attempts.max(1);
        let next = attempts.saturating_add(1);
        if next >= max_attempts {
            return RetryDecision::Exhausted {
                attempts: next.min(max_attempts),
            };
        }

        let delay = backoff.delay_for_attempt(next);
        RetryDecision::Retry {
            attempts: next,
            run_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
        }
    }
}

/// Enqueue options. Defaults: priority 0, due now, 3 attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Higher runs sooner.
    pub priority: i32,
    /// `None` means "now".
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            scheduled_at: None,
            max_attempts: 3,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// A unit of deferred, retryable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Opaque to the store; decoded by the handler.
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    /// Executions that ended in failure.
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Error from the most recent failed execution.
    pub last_error: Option<String>,
}

impl Job {
    /// Create a pending job. `max_attempts` below 1 is raised to 1.
    pub fn new(
        kind: JobKind,
        payload: serde_json::Value,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            payload,
            priority: options.priority,
            scheduled_at: options.scheduled_at.unwrap_or(now),
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        if !self.status.can_transition_to(next) {
            return Err(PersistenceError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Claim the job. Only a pending job can be claimed.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        if self.status != JobStatus::Pending {
            return Err(PersistenceError::NotClaimable {
                id: self.id,
                status: self.status,
            });
        }
        self.transition(JobStatus::Processing, now)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        self.transition(JobStatus::Completed, now)
    }

    /// Terminal failure. Records the final attempt.
    pub fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        self.transition(JobStatus::Failed, now)?;
        self.attempts = self.attempts.saturating_add(1).min(self.max_attempts);
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Back to pending for a later retry. `attempts` is clamped to `max_attempts`.
    pub fn reschedule(
        &mut self,
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.transition(JobStatus::Pending, now)?;
        self.attempts = attempts.min(self.max_attempts);
        self.scheduled_at = scheduled_at;
        self.last_error = Some(error.to_string());
        Ok(())
    }
}
