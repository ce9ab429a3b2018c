//! SMTP relay transport (lettre, tokio executor).

use std::time::Duration;

use lettre::message::header::{ContentType, MessageId};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::config::{SmtpConfig, TlsMode};

use super::{MailConnection, MailTransport, OutgoingMail, SendReceipt, TransportError};

/// Builds one lettre client per batch from [`SmtpConfig`].
#[derive(Debug, Clone)]
pub struct SmtpMailTransport {
    config: SmtpConfig,
}

impl SmtpMailTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn tls(&self) -> Result<Tls, TransportError> {
        if self.config.tls == TlsMode::None {
            return Ok(Tls::None);
        }

        let params = TlsParameters::builder(self.config.host.clone())
            .dangerous_accept_invalid_certs(self.config.accept_invalid_certs)
            .build()
            .map_err(|e| TransportError::Connect(format!("tls setup: {e}")))?;

        Ok(match self.config.tls {
            TlsMode::None => Tls::None,
            TlsMode::StartTls => Tls::Opportunistic(params),
            TlsMode::Required => Tls::Required(params),
            TlsMode::Wrapper => Tls::Wrapper(params),
        })
    }

    fn sender(&self) -> Result<Mailbox, TransportError> {
        let address: Address = self
            .config
            .from_address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(self.config.from_address.clone()))?;
        Ok(Mailbox::new(Some(self.config.from_name.clone()), address))
    }
}

#[async_trait::async_trait]
impl MailTransport for SmtpMailTransport {
    type Connection = SmtpConnection;

    async fn connect(&self) -> Result<SmtpConnection, TransportError> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(self.config.host.as_str())
                .port(self.config.port)
                .tls(self.tls()?)
                .timeout(Some(self.config.socket_timeout));

        if let Some(username) = &self.config.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            ));
        }

        debug!(
            host = %self.config.host,
            port = self.config.port,
            tls = ?self.config.tls,
            "opening smtp connection"
        );

        let sender = self.sender()?;
        let sender_domain = sender.email.domain().to_string();

        Ok(SmtpConnection {
            client: builder.build(),
            sender,
            sender_domain,
            verify_timeout: self.config.connect_timeout + self.config.greeting_timeout,
        })
    }
}

/// A lettre client bound to one batch.
pub struct SmtpConnection {
    client: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    sender_domain: String,
    verify_timeout: Duration,
}

impl std::fmt::Debug for SmtpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConnection")
            .field("sender", &self.sender.to_string())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl MailConnection for SmtpConnection {
    async fn verify(&mut self) -> Result<(), TransportError> {
        match tokio::time::timeout(self.verify_timeout, self.client.test_connection()).await {
            Err(_) => Err(TransportError::Timeout("verify")),
            Ok(Err(e)) => Err(TransportError::Verify(e.to_string())),
            Ok(Ok(false)) => Err(TransportError::Verify("relay did not answer NOOP".into())),
            Ok(Ok(true)) => Ok(()),
        }
    }

    async fn send(&mut self, mail: &OutgoingMail) -> Result<SendReceipt, TransportError> {
        let (message, message_id) = build_message(&self.sender, &self.sender_domain, mail)?;

        let response = self.client.send(message).await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout("send")
            } else {
                TransportError::Send(e.to_string())
            }
        })?;

        let text = response.message().collect::<Vec<_>>().join(" ");
        Ok(SendReceipt {
            message_id,
            response: format!("{} {}", response.code(), text),
        })
    }

    async fn close(self) -> Result<(), TransportError> {
        // Pooled connections are shut down when the client is dropped.
        drop(self.client);
        Ok(())
    }
}

/// Build the RFC 5322 message and its locally generated `Message-ID`.
fn build_message(
    sender: &Mailbox,
    sender_domain: &str,
    mail: &OutgoingMail,
) -> Result<(Message, String), TransportError> {
    let to: Address = mail
        .to
        .parse()
        .map_err(|_| TransportError::InvalidAddress(mail.to.clone()))?;
    let recipient = Mailbox::new(mail.to_name.clone(), to);
    let message_id = format!("{}@{}", uuid::Uuid::now_v7(), sender_domain);

    let message = Message::builder()
        .from(sender.clone())
        .to(recipient)
        .subject(mail.subject.as_str())
        .header(MessageId::from(format!("<{message_id}>")))
        .header(ContentType::TEXT_PLAIN)
        .body(mail.body.clone())
        .map_err(|e| TransportError::Send(format!("failed to build message: {e}")))?;

    Ok((message, message_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        let mut config = SmtpConfig::new("localhost", 2525, "shop@lederwaren.example");
        config.tls = TlsMode::None;
        config
    }

    fn mail(to: &str) -> OutgoingMail {
        OutgoingMail {
            to: to.into(),
            to_name: Some("Anna Kundin".into()),
            subject: "Order confirmation".into(),
            body: "Thank you for your order.".into(),
        }
    }

    #[tokio::test]
    async fn connect_builds_client_without_network() {
        let transport = SmtpMailTransport::new(config());
        let conn = transport.connect().await.unwrap();
        assert_eq!(conn.sender_domain, "lederwaren.example");
        assert_eq!(conn.verify_timeout, Duration::from_secs(10));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn bad_sender_address_is_rejected_at_connect() {
        let mut config = config();
        config.from_address = "not-an-address".into();
        let err = SmtpMailTransport::new(config).connect().await.unwrap_err();
        assert_eq!(err, TransportError::InvalidAddress("not-an-address".into()));
    }

    #[test]
    fn message_carries_sender_identity_and_message_id() {
        let sender = Mailbox::new(
            Some("Johanna Lederwaren".into()),
            "shop@lederwaren.example".parse().unwrap(),
        );
        let (message, id) =
            build_message(&sender, "lederwaren.example", &mail("anna@example.at")).unwrap();

        assert!(id.ends_with("@lederwaren.example"));
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Johanna Lederwaren"));
        assert!(raw.contains("<shop@lederwaren.example>"));
        assert!(raw.contains("<anna@example.at>"));
        assert!(raw.contains("Subject: Order confirmation"));
        assert!(raw.contains(&format!("<{id}>")));
        assert!(raw.contains("Thank you for your order."));
    }

    #[test]
    fn bad_recipient_is_invalid_address() {
        let sender = Mailbox::new(None, "shop@lederwaren.example".parse().unwrap());
        let err = build_message(&sender, "lederwaren.example", &mail("nope")).unwrap_err();
        assert_eq!(err, TransportError::InvalidAddress("nope".into()));
    }
}
