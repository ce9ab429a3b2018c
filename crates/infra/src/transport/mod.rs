//! Outbound mail transport.
//!
//! A worker cycle opens exactly one connection ([`MailTransport::connect`]),
//! checks it ([`MailConnection::verify`]), submits the whole batch through it
//! and closes it. Implementations:
//!
//! - `SmtpMailTransport`: lettre async SMTP relay client
//! - `MemoryMailTransport`: scripted in-process transport for tests/dev

use ledermail_core::EmailJob;

pub mod memory;
pub mod smtp;

pub use memory::{MemoryMailTransport, SentMail};
pub use smtp::SmtpMailTransport;

/// One message as handed to the transport. The sender identity is fixed by
/// the transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl From<&EmailJob> for OutgoingMail {
    fn from(job: &EmailJob) -> Self {
        Self {
            to: job.to_email.clone(),
            to_name: job.to_name.clone(),
            subject: job.subject.clone(),
            body: job.body.clone(),
        }
    }
}

/// What the relay told us about an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// `Message-ID` header value, without angle brackets.
    pub message_id: String,
    /// Relay response text (e.g. `250 2.0.0 Ok: queued as ...`).
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to mail relay: {0}")]
    Connect(String),
    #[error("mail relay verification failed: {0}")]
    Verify(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("mail relay timed out during {0}")]
    Timeout(&'static str),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("failed to close mail relay connection: {0}")]
    Close(String),
}

/// Factory for batch connections.
#[async_trait::async_trait]
pub trait MailTransport: Send + Sync {
    type Connection: MailConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// An open connection to the relay.
#[async_trait::async_trait]
pub trait MailConnection: Send {
    /// Protocol-level liveness check.
    async fn verify(&mut self) -> Result<(), TransportError>;

    async fn send(&mut self, mail: &OutgoingMail) -> Result<SendReceipt, TransportError>;

    /// Release the connection. Best effort: callers only log the error.
    async fn close(self) -> Result<(), TransportError>;
}
