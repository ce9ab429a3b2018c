//! Email queue storage.
//!
//! ## Design
//!
//! - The worker is the only writer of the lifecycle columns after enqueue
//! - Claims are conditional writes (`pending → processing`), so two workers
//!   racing on the same row cannot both win it
//! - Reads used by the admin log (`list_recent`, `stats`) never lock rows
//!
//! ## Components
//!
//! - `EmailQueueStore`: async storage boundary consumed by the worker and API
//! - `InMemoryEmailQueueStore`: tests/dev
//! - `PostgresEmailQueueStore`: `email_queue` table via sqlx

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use ledermail_core::{EmailJob, EmailJobId, EmailStatus, JobUpdate, NewEmail};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryEmailQueueStore;
pub use postgres::PostgresEmailQueueStore;

/// Filter used by the worker to select a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityQuery {
    pub limit: usize,
    pub max_attempts: u32,
    /// Also select `failed` rows with attempts left.
    pub include_failed: bool,
    pub now: DateTime<Utc>,
}

impl EligibilityQuery {
    pub fn matches(&self, job: &EmailJob) -> bool {
        job.is_eligible(self.now, self.max_attempts, self.include_failed)
    }
}

/// Queue statistics (admin dashboard).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    /// Subset of `failed` with no attempts left.
    pub exhausted: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed
    }

    pub(crate) fn count(&mut self, status: EmailStatus, n: u64) {
        match status {
            EmailStatus::Pending => self.pending += n,
            EmailStatus::Processing => self.processing += n,
            EmailStatus::Sent => self.sent += n,
            EmailStatus::Failed => self.failed += n,
        }
    }
}

/// Queue store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("email job not found: {0}")]
    NotFound(EmailJobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to decode row: {0}")]
    Decode(String),
}

/// Email queue store abstraction.
#[async_trait::async_trait]
pub trait EmailQueueStore: Send + Sync {
    /// Queue a new email (`pending`, no attempts, due now).
    async fn enqueue(&self, email: NewEmail) -> Result<EmailJob, StoreError>;

    /// Select up to `query.limit` eligible jobs, oldest `created_at` first.
    async fn fetch_eligible(&self, query: &EligibilityQuery) -> Result<Vec<EmailJob>, StoreError>;

    /// Atomically move a claimable row to `processing` and count one attempt.
    ///
    /// Returns `None` when the row is gone or no longer claimable (someone
    /// else claimed it, or it ran out of attempts).
    async fn claim(
        &self,
        id: EmailJobId,
        max_attempts: u32,
        include_failed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailJob>, StoreError>;

    /// Partial update of the lifecycle columns.
    async fn update_job(
        &self,
        id: EmailJobId,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: EmailJobId) -> Result<Option<EmailJob>, StoreError>;

    /// Newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<EmailJob>, StoreError>;

    async fn stats(&self, max_attempts: u32) -> Result<QueueStats, StoreError>;

    /// Put rows stuck in `processing` since before `cutoff` back to `pending`.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>)
    -> Result<u64, StoreError>;
}

#[async_trait::async_trait]
impl<S> EmailQueueStore for Arc<S>
where
    S: EmailQueueStore + ?Sized,
{
    async fn enqueue(&self, email: NewEmail) -> Result<EmailJob, StoreError> {
        (**self).enqueue(email).await
    }

    async fn fetch_eligible(&self, query: &EligibilityQuery) -> Result<Vec<EmailJob>, StoreError> {
        (**self).fetch_eligible(query).await
    }

    async fn claim(
        &self,
        id: EmailJobId,
        max_attempts: u32,
        include_failed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailJob>, StoreError> {
        (**self).claim(id, max_attempts, include_failed, now).await
    }

    async fn update_job(
        &self,
        id: EmailJobId,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).update_job(id, update, now).await
    }

    async fn get(&self, id: EmailJobId) -> Result<Option<EmailJob>, StoreError> {
        (**self).get(id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<EmailJob>, StoreError> {
        (**self).list_recent(limit).await
    }

    async fn stats(&self, max_attempts: u32) -> Result<QueueStats, StoreError> {
        (**self).stats(max_attempts).await
    }

    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).requeue_stale(cutoff, now).await
    }
}
