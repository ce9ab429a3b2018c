//! In-memory email queue for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use ledermail_core::{EmailJob, EmailJobId, EmailStatus, JobUpdate, NewEmail};

use super::{EligibilityQuery, EmailQueueStore, QueueStats, StoreError};

/// In-memory email queue.
///
/// Every operation takes the map lock once, so a claim is atomic with respect
/// to other claims exactly like the conditional `UPDATE` of the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryEmailQueueStore {
    jobs: RwLock<HashMap<EmailJobId, EmailJob>>,
}

impl InMemoryEmailQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully-formed row (tests use this to seed arbitrary states).
    pub fn insert(&self, job: EmailJob) -> Result<(), StoreError> {
        self.write()?.insert(job.id, job);
        Ok(())
    }

    /// Snapshot of every row, oldest first.
    pub fn all(&self) -> Result<Vec<EmailJob>, StoreError> {
        let mut jobs: Vec<_> = self.read()?.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<EmailJobId, EmailJob>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Storage("email queue lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<EmailJobId, EmailJob>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Storage("email queue lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl EmailQueueStore for InMemoryEmailQueueStore {
    async fn enqueue(&self, email: NewEmail) -> Result<EmailJob, StoreError> {
        let job = EmailJob::new(email, Utc::now());
        self.write()?.insert(job.id, job.clone());
        Ok(job)
    }

    async fn fetch_eligible(&self, query: &EligibilityQuery) -> Result<Vec<EmailJob>, StoreError> {
        let jobs = self.read()?;
        let mut eligible: Vec<_> = jobs.values().filter(|j| query.matches(j)).cloned().collect();

        // FIFO by creation time; id breaks ties deterministically.
        eligible.sort_by_key(|j| (j.created_at, j.id));
        eligible.truncate(query.limit);
        Ok(eligible)
    }

    async fn claim(
        &self,
        id: EmailJobId,
        max_attempts: u32,
        include_failed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailJob>, StoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&id) {
            Some(job) if job.is_claimable(max_attempts, include_failed) => {
                let attempts = job.attempts + 1;
                job.apply(&JobUpdate::claim(attempts), now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_job(
        &self,
        id: EmailJobId,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.apply(update, now);
        Ok(())
    }

    async fn get(&self, id: EmailJobId) -> Result<Option<EmailJob>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<EmailJob>, StoreError> {
        let mut jobs: Vec<_> = self.read()?.values().cloned().collect();
        jobs.sort_by_key(|j| std::cmp::Reverse((j.created_at, j.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn stats(&self, max_attempts: u32) -> Result<QueueStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            stats.count(job.status, 1);
            if job.is_exhausted(max_attempts) {
                stats.exhausted += 1;
            }
        }
        Ok(stats)
    }

    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let mut requeued = 0;
        for job in jobs.values_mut() {
            if job.status == EmailStatus::Processing && job.updated_at < cutoff {
                job.apply(&JobUpdate::requeue(), now);
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}
