//! Infrastructure layer: queue storage, mail transport, worker, config.

pub mod config;
pub mod queue;
pub mod transport;
pub mod worker;

pub use config::{AppConfig, ConfigError, RunnerConfig, SmtpConfig, TlsMode, WorkerConfig};
pub use queue::{
    EligibilityQuery, EmailQueueStore, InMemoryEmailQueueStore, PostgresEmailQueueStore,
    QueueStats, StoreError,
};
pub use transport::{
    MailConnection, MailTransport, MemoryMailTransport, OutgoingMail, SendReceipt,
    SmtpMailTransport, TransportError,
};
pub use worker::{CycleReport, QueueCycle, QueueRunner, QueueRunnerHandle, QueueWorker, WorkerError};
