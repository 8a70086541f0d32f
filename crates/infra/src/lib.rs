//! Infrastructure layer: job queue, waitlist promotion, Postgres adapters, config.

pub mod cleanup;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod notifications;
pub mod schema;
pub mod stats;
pub mod waitlist;

pub use error::{DispatchError, HandlerError, PersistenceError};
