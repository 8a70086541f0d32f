//! `rollcall-core`: domain building blocks shared across the workspace.
//!
//! Pure types only: identifiers and the domain error model. Storage, scheduling and
//! notification concerns live in `rollcall-infra`.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{ClassId, EnrollmentRequestId, StudentId, WaitlistEntryId};
