//! Command-line interface of the `ledermail` binary.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use ledermail_core::{EmailAddress, NewEmail};
use ledermail_infra::{
    MailConnection, MailTransport, OutgoingMail, SendReceipt, TransportError,
};

/// Transactional email queue worker for the shop.
#[derive(Parser, Debug)]
#[command(name = "ledermail", version)]
#[command(about = "Sends queued shop emails through the SMTP relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HTTP API plus the background queue runner
    Serve {
        /// Bind address (overrides LISTEN_ADDR)
        #[arg(long = "listen")]
        listen: Option<SocketAddr>,

        /// Only serve HTTP; cycles run when POST /email-queue/process is called
        #[arg(long = "no-runner")]
        no_runner: bool,
    },

    /// Process the queue every poll interval until interrupted
    Run,

    /// Process one batch and exit (non-zero on failure)
    Once,

    /// Connect to the relay and send a test message
    SmtpTest {
        /// Recipient of the test message
        #[arg(long = "to")]
        to: String,
    },

    /// Create the email_queue table in DATABASE_URL
    Migrate,
}

/// Connect, verify, send one test message and close.
pub async fn send_test_message<T>(
    transport: &T,
    to: EmailAddress,
    shop_name: &str,
) -> Result<SendReceipt, TransportError>
where
    T: MailTransport,
{
    let email = NewEmail::test_email(to, shop_name);
    let mail = OutgoingMail {
        to: email.to_email.into(),
        to_name: email.to_name,
        subject: email.subject,
        body: email.body,
    };

    let mut conn = transport.connect().await?;
    let result = match conn.verify().await {
        Ok(()) => conn.send(&mail).await,
        Err(e) => Err(e),
    };
    if let Err(e) = conn.close().await {
        tracing::warn!(error = %e, "failed to close mail relay connection");
    }
    result
}
