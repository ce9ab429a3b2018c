//! Email queue worker.
//!
//! One cycle (`QueueWorker::run_cycle`):
//! 1. refuse to start if this worker already has a cycle in flight
//! 2. optionally requeue rows stuck in `processing`
//! 3. fetch up to `batch_size` eligible jobs, oldest first
//! 4. open one relay connection (connect + verify, retried with backoff)
//! 5. per job: conditional claim, send with in-place retries, record outcome
//! 6. close the connection (errors only logged)
//!
//! Per-job failures never abort the batch. Only fetch and connection
//! failures surface as [`WorkerError`].

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use ledermail_core::{EmailJob, JobUpdate};

use crate::config::WorkerConfig;
use crate::queue::{EligibilityQuery, EmailQueueStore, StoreError};
use crate::transport::{MailConnection, MailTransport, OutgoingMail, SendReceipt, TransportError};

pub mod runner;

pub use runner::{QueueRunner, QueueRunnerHandle};

/// Outcome counters of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Fetched but claimed by someone else first.
    pub skipped: usize,
    /// Claim/update writes that failed; the job keeps its last durable state.
    pub store_errors: usize,
    /// Stale `processing` rows put back to `pending`.
    pub requeued: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("email queue cycle already running")]
    AlreadyRunning,
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),
    #[error("mail transport error: {0}")]
    Transport(#[from] TransportError),
    /// The task running the cycle ended without reporting (panic or abort).
    #[error("email queue cycle ended without a result")]
    Interrupted,
}

/// Anything that can run one queue cycle (what the runner and the HTTP
/// trigger hold on to).
#[async_trait::async_trait]
pub trait QueueCycle: Send + Sync {
    async fn run_cycle(&self) -> Result<CycleReport, WorkerError>;
}

pub struct QueueWorker<S, T> {
    store: S,
    transport: T,
    config: WorkerConfig,
    run_lock: Mutex<()>,
}

impl<S, T> QueueWorker<S, T>
where
    S: EmailQueueStore,
    T: MailTransport,
{
    pub fn new(store: S, transport: T, config: WorkerConfig) -> Self {
        Self {
            store,
            transport,
            config,
            run_lock: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether a cycle currently holds the run-lock.
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Process one batch.
    pub async fn run_cycle(&self) -> Result<CycleReport, WorkerError> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| WorkerError::AlreadyRunning)?;

        let mut report = CycleReport::default();
        let now = Utc::now();

        if let Some(stale_after) = self.config.stale_after {
            match stale_cutoff(now, stale_after) {
                Some(cutoff) => {
                    report.requeued = self.store.requeue_stale(cutoff, now).await?;
                    if report.requeued > 0 {
                        warn!(requeued = report.requeued, "requeued stale processing jobs");
                    }
                }
                None => warn!(
                    stale_after_secs = stale_after.as_secs(),
                    "stale_after out of range, not requeuing"
                ),
            }
        }

        let query = EligibilityQuery {
            limit: self.config.batch_size,
            max_attempts: self.config.max_attempts,
            include_failed: self.config.retry_failed,
            now,
        };
        let jobs = self.store.fetch_eligible(&query).await?;
        report.fetched = jobs.len();

        if jobs.is_empty() {
            debug!("no eligible emails");
            return Ok(report);
        }

        info!(count = jobs.len(), "processing email batch");
        let mut conn = self.open_connection().await?;

        for (index, job) in jobs.iter().enumerate() {
            let attempted = self.process_job(&mut conn, job, &mut report).await;

            let more = index + 1 < jobs.len();
            if attempted && more && !self.config.pacing_delay.is_zero() {
                tokio::time::sleep(self.config.pacing_delay).await;
            }
        }

        if let Err(e) = conn.close().await {
            warn!(error = %e, "failed to close mail relay connection");
        }

        info!(
            fetched = report.fetched,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            store_errors = report.store_errors,
            "email batch finished"
        );
        Ok(report)
    }

    /// Connect and verify, retrying with `connect_retry`.
    async fn open_connection(&self) -> Result<T::Connection, WorkerError> {
        let policy = self.config.connect_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.connect_verified().await {
                Ok(conn) => return Ok(conn),
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "mail relay unavailable, retrying"
                    );
                    sleep_unless_zero(delay).await;
                }
                Err(e) => {
                    error!(attempt, error = %e, "giving up on mail relay");
                    return Err(WorkerError::Transport(e));
                }
            }
        }
    }

    async fn connect_verified(&self) -> Result<T::Connection, TransportError> {
        let mut conn = self.transport.connect().await?;
        if let Err(e) = conn.verify().await {
            if let Err(close_err) = conn.close().await {
                debug!(error = %close_err, "close after failed verify");
            }
            return Err(e);
        }
        Ok(conn)
    }

    /// Returns whether a send was attempted.
    async fn process_job(
        &self,
        conn: &mut T::Connection,
        job: &EmailJob,
        report: &mut CycleReport,
    ) -> bool {
        let prior_attempts = job.attempts;

        let claimed = match self
            .store
            .claim(
                job.id,
                self.config.max_attempts,
                self.config.retry_failed,
                Utc::now(),
            )
            .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(job_id = %job.id, "email job already taken, skipping");
                report.skipped += 1;
                return false;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to claim email job");
                report.store_errors += 1;
                return false;
            }
        };
        report.claimed += 1;

        let mail = OutgoingMail::from(&claimed);
        let now = Utc::now();
        let update = match self.send_with_retry(conn, &mail).await {
            Ok(receipt) => {
                info!(
                    job_id = %claimed.id,
                    to = %mail.to,
                    message_id = %receipt.message_id,
                    "email sent"
                );
                report.sent += 1;
                JobUpdate::sent(now)
            }
            Err(e) => {
                let next_attempt_at = self.config.queue_backoff.next_attempt_at(now, prior_attempts);
                if claimed.attempts >= self.config.max_attempts {
                    error!(
                        job_id = %claimed.id,
                        attempts = claimed.attempts,
                        error = %e,
                        "email failed, no attempts left"
                    );
                } else {
                    warn!(
                        job_id = %claimed.id,
                        attempts = claimed.attempts,
                        error = %e,
                        next_attempt_at = %next_attempt_at,
                        "email failed, will retry"
                    );
                }
                report.failed += 1;
                JobUpdate::failed(e.to_string(), next_attempt_at)
            }
        };

        if let Err(e) = self.store.update_job(claimed.id, &update, Utc::now()).await {
            error!(job_id = %claimed.id, error = %e, "failed to record email outcome");
            report.store_errors += 1;
        }
        true
    }

    /// Send with the in-place `send_retry` policy.
    async fn send_with_retry(
        &self,
        conn: &mut T::Connection,
        mail: &OutgoingMail,
    ) -> Result<SendReceipt, TransportError> {
        let policy = self.config.send_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match conn.send(mail).await {
                Ok(receipt) => return Ok(receipt),
                // A malformed address fails the same way every time.
                Err(e @ TransportError::InvalidAddress(_)) => return Err(e),
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(attempt, to = %mail.to, error = %e, "send failed, retrying");
                    sleep_unless_zero(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl<S, T> QueueCycle for QueueWorker<S, T>
where
    S: EmailQueueStore,
    T: MailTransport,
{
    async fn run_cycle(&self) -> Result<CycleReport, WorkerError> {
        QueueWorker::run_cycle(self).await
    }
}

/// `now - stale_after`, or `None` when that is not a representable instant.
/// A zero age would requeue rows that are being sent right now.
fn stale_cutoff(now: DateTime<Utc>, stale_after: Duration) -> Option<DateTime<Utc>> {
    if stale_after.is_zero() {
        return None;
    }
    let age = TimeDelta::from_std(stale_after).ok()?;
    now.checked_sub_signed(age)
}

async fn sleep_unless_zero(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::{DateTime, Duration as ChronoDuration};
    use ledermail_core::{EmailAddress, EmailJobId, EmailStatus, NewEmail};

    use super::*;
    use crate::queue::{InMemoryEmailQueueStore, QueueStats};
    use crate::transport::MemoryMailTransport;

    /// In-memory store that counts writes and can fail updates for one job.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryEmailQueueStore,
        claims: AtomicUsize,
        updates: AtomicUsize,
        fail_update_for: std::sync::Mutex<Option<EmailJobId>>,
        /// Claims of this job lose the race to another worker.
        taken_elsewhere: std::sync::Mutex<Option<EmailJobId>>,
    }

    #[async_trait::async_trait]
    impl EmailQueueStore for CountingStore {
        async fn enqueue(&self, email: NewEmail) -> Result<EmailJob, StoreError> {
            self.inner.enqueue(email).await
        }

        async fn fetch_eligible(
            &self,
            query: &EligibilityQuery,
        ) -> Result<Vec<EmailJob>, StoreError> {
            self.inner.fetch_eligible(query).await
        }

        async fn claim(
            &self,
            id: EmailJobId,
            max_attempts: u32,
            include_failed: bool,
            now: DateTime<Utc>,
        ) -> Result<Option<EmailJob>, StoreError> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            let taken = *self.taken_elsewhere.lock().unwrap() == Some(id);
            if taken {
                return Ok(None);
            }
            self.inner.claim(id, max_attempts, include_failed, now).await
        }

        async fn update_job(
            &self,
            id: EmailJobId,
            update: &JobUpdate,
            now: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            let fail = *self.fail_update_for.lock().unwrap() == Some(id);
            if fail {
                return Err(StoreError::Storage("connection reset".into()));
            }
            self.inner.update_job(id, update, now).await
        }

        async fn get(&self, id: EmailJobId) -> Result<Option<EmailJob>, StoreError> {
            self.inner.get(id).await
        }

        async fn list_recent(&self, limit: usize) -> Result<Vec<EmailJob>, StoreError> {
            self.inner.list_recent(limit).await
        }

        async fn stats(&self, max_attempts: u32) -> Result<QueueStats, StoreError> {
            self.inner.stats(max_attempts).await
        }

        async fn requeue_stale(
            &self,
            cutoff: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.inner.requeue_stale(cutoff, now).await
        }
    }

    type TestWorker = QueueWorker<Arc<CountingStore>, MemoryMailTransport>;

    fn worker(transport: MemoryMailTransport) -> (TestWorker, Arc<CountingStore>) {
        let store = Arc::new(CountingStore::default());
        let worker = QueueWorker::new(
            store.clone(),
            transport,
            WorkerConfig::default().without_delays(),
        );
        (worker, store)
    }

    /// Seed a pending job created `age_secs` ago.
    fn seed(store: &CountingStore, to: &str, attempts: u32, age_secs: i64) -> EmailJobId {
        let email = NewEmail::new(EmailAddress::parse(to).unwrap(), "Bestellung", "Danke").unwrap();
        let created = Utc::now() - ChronoDuration::seconds(age_secs);
        let mut job = EmailJob::new(email, created);
        job.attempts = attempts;
        job.next_attempt_at = Utc::now() - ChronoDuration::seconds(1);
        let id = job.id;
        store.inner.insert(job).unwrap();
        id
    }

    async fn job(store: &CountingStore, id: EmailJobId) -> EmailJob {
        store.inner.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn successful_send_marks_job_sent() {
        let transport = MemoryMailTransport::new();
        let (worker, store) = worker(transport.clone());
        let id = seed(&store, "anna@example.at", 0, 10);

        let before = Utc::now();
        let report = worker.run_cycle().await.unwrap();

        assert_eq!(report.sent, 1);
        let job = job(&store, id).await;
        assert_eq!(job.status, EmailStatus::Sent);
        assert_eq!(job.attempts, 1);
        assert!(job.sent_at.unwrap() >= before);
        assert!(job.error.is_none());
        assert_eq!(transport.sent()[0].mail.to, "anna@example.at");
    }

    #[tokio::test]
    async fn last_attempt_failure_backs_off_and_exhausts() {
        let transport = MemoryMailTransport::new().always_fail_to("bounce@example.at");
        let (worker, store) = worker(transport);
        let id = seed(&store, "bounce@example.at", 2, 10);

        let before = Utc::now();
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);

        let job = job(&store, id).await;
        assert_eq!(job.status, EmailStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.as_deref().unwrap().contains("550"));
        let delay = job.next_attempt_at - before;
        assert!(delay >= ChronoDuration::minutes(20));
        assert!(delay < ChronoDuration::minutes(21));
        assert!(job.is_exhausted(3));

        // Never fetched again, not even with failed-row retries enabled.
        let query = EligibilityQuery {
            limit: 10,
            max_attempts: 3,
            include_failed: true,
            now: Utc::now() + ChronoDuration::days(2),
        };
        assert!(store.fetch_eligible(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_size_bounds_claims() {
        let (worker, store) = worker(MemoryMailTransport::new());
        let ids: Vec<_> = (0..6)
            .map(|i| seed(&store, &format!("k{i}@example.at"), 0, 60 - i))
            .collect();

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 5);

        for id in &ids[..5] {
            assert_eq!(job(&store, *id).await.status, EmailStatus::Sent);
        }
        let newest = job(&store, ids[5]).await;
        assert_eq!(newest.status, EmailStatus::Pending);
        assert_eq!(newest.attempts, 0);
    }

    #[tokio::test]
    async fn attempts_grow_by_one_per_claim() {
        let transport = MemoryMailTransport::new().always_fail_to("x@example.at");
        let store = Arc::new(CountingStore::default());
        let mut config = WorkerConfig::default().without_delays();
        config.retry_failed = true;
        config.queue_backoff = config.queue_backoff.without_delay();
        let worker = QueueWorker::new(store.clone(), transport, config);
        let id = seed(&store, "x@example.at", 0, 10);

        let mut seen = Vec::new();
        for _ in 0..4 {
            worker.run_cycle().await.unwrap();
            seen.push(job(&store, id).await.attempts);
        }
        assert_eq!(seen, vec![1, 2, 3, 3]);
    }

    #[tokio::test]
    async fn success_clears_a_previous_error() {
        let (worker, store) = worker(MemoryMailTransport::new());
        let id = seed(&store, "anna@example.at", 1, 10);
        store
            .inner
            .update_job(
                id,
                &JobUpdate {
                    error: Some(Some("old failure".into())),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();

        worker.run_cycle().await.unwrap();
        let job = job(&store, id).await;
        assert_eq!(job.status, EmailStatus::Sent);
        assert!(job.error.is_none());
        assert!(job.sent_at.is_some());
    }

    #[tokio::test]
    async fn one_failing_job_does_not_stop_the_batch() {
        let transport = MemoryMailTransport::new().always_fail_to("k2@example.at");
        let (worker, store) = worker(transport.clone());
        let ids: Vec<_> = (0..5)
            .map(|i| seed(&store, &format!("k{i}@example.at"), 0, 60 - i))
            .collect();

        let report = worker.run_cycle().await.unwrap();
        assert_eq!((report.sent, report.failed), (4, 1));

        for (i, id) in ids.iter().enumerate() {
            let expected = if i == 2 {
                EmailStatus::Failed
            } else {
                EmailStatus::Sent
            };
            assert_eq!(job(&store, *id).await.status, expected);
        }
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test]
    async fn empty_queue_touches_nothing() {
        let transport = MemoryMailTransport::new();
        let (worker, store) = worker(transport.clone());

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(transport.connects(), 0);
        assert_eq!(store.claims.load(Ordering::SeqCst), 0);
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_refused() {
        let (transport, gate) = MemoryMailTransport::new().gated();
        let (worker, store) = worker(transport.clone());
        seed(&store, "anna@example.at", 0, 10);
        let worker = Arc::new(worker);

        let first = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_cycle().await }
        });
        while transport.connects() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(worker.is_running());
        assert!(matches!(
            worker.run_cycle().await,
            Err(WorkerError::AlreadyRunning)
        ));

        gate.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.sent, 1);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn relay_down_leaves_jobs_pending() {
        let transport = MemoryMailTransport::new().fail_connect(3);
        let (worker, store) = worker(transport.clone());
        let id = seed(&store, "anna@example.at", 0, 10);

        let err = worker.run_cycle().await.unwrap_err();
        assert!(matches!(err, WorkerError::Transport(TransportError::Connect(_))));
        assert_eq!(transport.connects(), 3);
        assert_eq!(store.claims.load(Ordering::SeqCst), 0);

        let job = job(&store, id).await;
        assert_eq!((job.status, job.attempts), (EmailStatus::Pending, 0));
    }

    #[tokio::test]
    async fn relay_recovers_within_connect_retries() {
        let transport = MemoryMailTransport::new().fail_verify(2);
        let (worker, store) = worker(transport.clone());
        seed(&store, "anna@example.at", 0, 10);

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(transport.verifies(), 3);
    }

    #[tokio::test]
    async fn close_error_is_swallowed() {
        let transport = MemoryMailTransport::new().fail_close();
        let (worker, store) = worker(transport.clone());
        let id = seed(&store, "anna@example.at", 0, 10);

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(job(&store, id).await.status, EmailStatus::Sent);
    }

    #[tokio::test]
    async fn transient_send_error_is_retried_in_place() {
        let transport = MemoryMailTransport::new().fail_sends_to("anna@example.at", 2);
        let (worker, store) = worker(transport.clone());
        let id = seed(&store, "anna@example.at", 0, 10);

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(transport.send_attempts(), 3);
        assert_eq!(job(&store, id).await.attempts, 1);
    }

    #[tokio::test]
    async fn store_update_error_is_isolated() {
        let (worker, store) = worker(MemoryMailTransport::new());
        let first = seed(&store, "a@example.at", 0, 30);
        let second = seed(&store, "b@example.at", 0, 20);
        *store.fail_update_for.lock().unwrap() = Some(first);

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.store_errors, 1);
        assert_eq!(report.sent, 2);

        // Left as claimed; the second job still completed.
        assert_eq!(job(&store, first).await.status, EmailStatus::Processing);
        assert_eq!(job(&store, second).await.status, EmailStatus::Sent);
    }

    #[tokio::test]
    async fn lost_claim_is_skipped() {
        let (worker, store) = worker(MemoryMailTransport::new());
        let id = seed(&store, "a@example.at", 0, 10);

        // Another worker claims the row between fetch and claim.
        let query = EligibilityQuery {
            limit: 5,
            max_attempts: 3,
            include_failed: false,
            now: Utc::now(),
        };
        let fetched = store.fetch_eligible(&query).await.unwrap();
        store.inner.claim(id, 3, false, Utc::now()).await.unwrap();

        let mut conn = worker.transport().connect().await.unwrap();
        let mut report = CycleReport::default();
        let attempted = worker.process_job(&mut conn, &fetched[0], &mut report).await;

        assert!(!attempted);
        assert_eq!(report.skipped, 1);
        assert_eq!(job(&store, id).await.attempts, 1);
    }

    #[tokio::test]
    async fn stale_processing_rows_are_requeued_when_enabled() {
        let store = Arc::new(CountingStore::default());
        let mut config = WorkerConfig::default().without_delays();
        config.stale_after = Some(Duration::from_secs(600));
        let worker = QueueWorker::new(store.clone(), MemoryMailTransport::new(), config);

        let id = seed(&store, "a@example.at", 0, 3600);
        store.inner.claim(id, 3, false, Utc::now() - ChronoDuration::hours(1)).await.unwrap();

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.requeued, 1);
        let job = job(&store, id).await;
        assert_eq!(job.status, EmailStatus::Sent);
        assert_eq!(job.attempts, 2);
    }

    fn paced_worker(transport: MemoryMailTransport) -> (TestWorker, Arc<CountingStore>) {
        let store = Arc::new(CountingStore::default());
        let config = WorkerConfig {
            pacing_delay: Duration::from_secs(2),
            ..WorkerConfig::default().without_delays()
        };
        (QueueWorker::new(store.clone(), transport, config), store)
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_sleeps_between_sends_but_not_after_the_last() {
        let (worker, store) = paced_worker(MemoryMailTransport::new());
        seed(&store, "a@example.at", 0, 30);
        seed(&store, "b@example.at", 0, 20);
        seed(&store, "c@example.at", 0, 10);

        let started = tokio::time::Instant::now();
        let report = worker.run_cycle().await.unwrap();

        assert_eq!(report.sent, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn single_job_batch_does_not_pace() {
        let (worker, store) = paced_worker(MemoryMailTransport::new());
        seed(&store, "a@example.at", 0, 10);

        let started = tokio::time::Instant::now();
        let report = worker.run_cycle().await.unwrap();

        assert_eq!(report.sent, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_job_does_not_pace() {
        let (worker, store) = paced_worker(MemoryMailTransport::new());
        let taken = seed(&store, "a@example.at", 0, 30);
        seed(&store, "b@example.at", 0, 20);
        seed(&store, "c@example.at", 0, 10);
        *store.taken_elsewhere.lock().unwrap() = Some(taken);

        let started = tokio::time::Instant::now();
        let report = worker.run_cycle().await.unwrap();

        assert_eq!((report.skipped, report.sent), (1, 2));
        // Only the pause between b and c.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn out_of_range_stale_after_leaves_processing_rows_alone() {
        assert!(stale_cutoff(Utc::now(), Duration::ZERO).is_none());

        for secs in [9_000_000_000_000, 10_000_000_000_000, u64::MAX] {
            let store = Arc::new(CountingStore::default());
            let mut config = WorkerConfig::default().without_delays();
            config.stale_after = Some(Duration::from_secs(secs));
            let worker = QueueWorker::new(store.clone(), MemoryMailTransport::new(), config);

            let id = seed(&store, "a@example.at", 0, 3600);
            store.inner.claim(id, 3, false, Utc::now()).await.unwrap();

            let report = worker.run_cycle().await.unwrap();
            assert_eq!(report.requeued, 0, "stale_after={secs}s");
            assert_eq!(job(&store, id).await.status, EmailStatus::Processing);
        }
    }
}
