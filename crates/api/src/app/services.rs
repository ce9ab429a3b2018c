//! Service wiring: queue store, SMTP transport and the worker shared by the
//! HTTP handlers and the background runner.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use ledermail_core::{EmailAddress, EmailJob, EmailJobId, NewEmail};
use ledermail_infra::{
    AppConfig, CycleReport, EmailQueueStore, InMemoryEmailQueueStore, MailTransport,
    PostgresEmailQueueStore, QueueCycle, QueueStats, QueueWorker, SmtpMailTransport, StoreError,
    WorkerConfig, WorkerError,
};

pub struct AppServices {
    store: Arc<dyn EmailQueueStore>,
    worker: Arc<dyn QueueCycle>,
    max_attempts: u32,
    shop_name: String,
    /// Cycles started on behalf of requests; they outlive the request.
    cycles: Mutex<JoinSet<()>>,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn EmailQueueStore>,
        worker: Arc<dyn QueueCycle>,
        max_attempts: u32,
        shop_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            worker,
            max_attempts,
            shop_name: shop_name.into(),
            cycles: Mutex::new(JoinSet::new()),
        }
    }

    /// Wire a worker over `store` and `transport`.
    pub fn with_transport<T>(
        store: Arc<dyn EmailQueueStore>,
        transport: T,
        worker_config: WorkerConfig,
        shop_name: impl Into<String>,
    ) -> Self
    where
        T: MailTransport + 'static,
    {
        let max_attempts = worker_config.max_attempts;
        let worker = Arc::new(QueueWorker::new(store.clone(), transport, worker_config));
        Self::new(store, worker, max_attempts, shop_name)
    }

    pub fn worker(&self) -> Arc<dyn QueueCycle> {
        self.worker.clone()
    }

    /// Run one cycle and wait for its report. The cycle runs on its own task,
    /// so dropping this future (client gone, request timeout) does not stop it
    /// between a claim and the outcome write.
    pub async fn process_queue(&self) -> Result<CycleReport, WorkerError> {
        self.spawn_cycle("process")
            .await
            .unwrap_or(Err(WorkerError::Interrupted))
    }

    /// Wait for every cycle started through [`Self::process_queue`] or
    /// [`Self::send_test_email`] to finish.
    pub async fn wait_for_cycles(&self) {
        let mut cycles = std::mem::replace(&mut *self.cycles(), JoinSet::new());
        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "email queue cycle task failed");
            }
        }
    }

    fn cycles(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.cycles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a tracked cycle. Its outcome goes to the receiver, or to the
    /// log when nobody is waiting any more.
    fn spawn_cycle(
        &self,
        trigger: &'static str,
    ) -> oneshot::Receiver<Result<CycleReport, WorkerError>> {
        let (tx, rx) = oneshot::channel();
        let worker = self.worker.clone();

        let mut cycles = self.cycles();
        while cycles.try_join_next().is_some() {}
        cycles.spawn(async move {
            let result = worker.run_cycle().await;
            if let Err(unclaimed) = tx.send(result) {
                match unclaimed {
                    Ok(report) => info!(
                        trigger,
                        sent = report.sent,
                        failed = report.failed,
                        "detached email queue cycle finished"
                    ),
                    Err(WorkerError::AlreadyRunning) => info!(
                        trigger,
                        "cycle already running; queued mail goes out with it or the next one"
                    ),
                    Err(e) => error!(trigger, error = %e, "detached email queue cycle failed"),
                }
            }
        });
        rx
    }

    pub async fn enqueue(&self, email: NewEmail) -> Result<EmailJob, StoreError> {
        let job = self.store.enqueue(email).await?;
        info!(job_id = %job.id, to = %job.to_email, "email queued");
        Ok(job)
    }

    pub async fn get(&self, id: EmailJobId) -> Result<Option<EmailJob>, StoreError> {
        self.store.get(id).await
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<EmailJob>, StoreError> {
        self.store.list_recent(limit).await
    }

    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.store.stats(self.max_attempts).await
    }

    /// Queue the shop's test email and start a cycle in the background.
    pub async fn send_test_email(&self, to: EmailAddress) -> Result<EmailJob, StoreError> {
        let job = self
            .enqueue(NewEmail::test_email(to, &self.shop_name))
            .await?;

        drop(self.spawn_cycle("test_email"));
        Ok(job)
    }
}

/// Open the configured store: Postgres when `DATABASE_URL` is set, otherwise
/// an in-memory queue that is lost on restart.
pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn EmailQueueStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresEmailQueueStore::connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory email queue (not durable)");
            Ok(InMemoryEmailQueueStore::arc())
        }
    }
}

/// Production wiring: configured store + SMTP relay.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let store = open_store(config).await?;
    let transport = SmtpMailTransport::new(config.smtp.clone());

    Ok(AppServices::with_transport(
        store,
        transport,
        config.worker.clone(),
        config.smtp.from_name.clone(),
    ))
}
