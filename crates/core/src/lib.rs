//! Domain model of the outbound email queue.
//!
//! This crate contains **pure domain** types (no I/O): the queued job, its
//! status lifecycle, partial updates applied by the worker and the retry
//! policy shared by the queue and transport layers.

pub mod address;
pub mod email;
pub mod error;
pub mod id;
pub mod retry;

pub use address::EmailAddress;
pub use email::{EmailJob, EmailStatus, JobUpdate, NewEmail};
pub use error::{DomainError, DomainResult};
pub use id::EmailJobId;
pub use retry::RetryPolicy;
