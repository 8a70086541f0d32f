//! Background job system with retry and backoff.
//!
//! ## Design
//!
//! - Job kinds are a closed enum; payloads are opaque JSON in the store and typed at
//!   the edges (`payload`)
//! - Every kind has exactly one handler, checked when the registry is built
//! - The processor polls for due jobs and runs them with bounded concurrency
//! - Failed jobs retry with exponential backoff until `max_attempts`, then stay
//!   `failed` for inspection (`JobStore::list_by_status`)
//!
//! ## Components
//!
//! - `Job`: the persisted record and its status machine
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `HandlerRegistry`: kind → handler
//! - `Processor`: the polling loop
//! - `PeriodicEnqueuer`: enqueues a fixed job on an interval

pub mod payload;
pub mod postgres;
pub mod processor;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use payload::JobPayload;
pub use postgres::PostgresJobStore;
pub use processor::{
    JobOutcome, Processor, ProcessorError, ProcessorStats, StrandedJob, TerminalJobFailure,
    TickReport,
};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder, JobHandler, RegistryError};
pub use scheduler::{EnqueuerHandle, PeriodicEnqueuer};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreExt};
pub use types::{BackoffPolicy, EnqueueOptions, Job, JobId, JobKind, JobStatus, RetryDecision};
