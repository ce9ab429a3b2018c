//! In-process transport that records what would have been sent.
//!
//! Failures are scripted up front (`fail_connect(2)`, `fail_sends_to(addr, 1)`,
//! ...) so worker behavior under relay errors can be driven deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::{MailConnection, MailTransport, OutgoingMail, SendReceipt, TransportError};

/// A delivered message as recorded by [`MemoryMailTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub mail: OutgoingMail,
    pub message_id: String,
}

#[derive(Debug, Default)]
struct State {
    sent: Vec<SentMail>,
    connects: u32,
    verifies: u32,
    closes: u32,
    send_attempts: u32,
    fail_connect: u32,
    fail_verify: u32,
    fail_close: bool,
    /// Remaining failures per recipient; `u32::MAX` never runs out.
    fail_recipients: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMailTransport {
    state: Arc<Mutex<State>>,
    gate: Option<Arc<Notify>>,
}

impl MemoryMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` connects.
    pub fn fail_connect(self, times: u32) -> Self {
        self.state().fail_connect = times;
        self
    }

    /// Fail the next `times` verifications.
    pub fn fail_verify(self, times: u32) -> Self {
        self.state().fail_verify = times;
        self
    }

    pub fn fail_close(self) -> Self {
        self.state().fail_close = true;
        self
    }

    /// Reject the next `times` sends to `to`.
    pub fn fail_sends_to(self, to: impl Into<String>, times: u32) -> Self {
        self.state().fail_recipients.insert(to.into(), times);
        self
    }

    /// Reject every send to `to`.
    pub fn always_fail_to(self, to: impl Into<String>) -> Self {
        self.fail_sends_to(to, u32::MAX)
    }

    /// Make `connect` wait until the returned handle is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.state().sent.clone()
    }

    pub fn connects(&self) -> u32 {
        self.state().connects
    }

    pub fn verifies(&self) -> u32 {
        self.state().verifies
    }

    pub fn closes(&self) -> u32 {
        self.state().closes
    }

    pub fn send_attempts(&self) -> u32 {
        self.state().send_attempts
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter == 0 {
        return false;
    }
    if *counter != u32::MAX {
        *counter -= 1;
    }
    true
}

#[async_trait::async_trait]
impl MailTransport for MemoryMailTransport {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, TransportError> {
        let refused = {
            let mut state = self.state();
            state.connects += 1;
            take_failure(&mut state.fail_connect)
        };

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }
        Ok(MemoryConnection {
            transport: self.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    transport: MemoryMailTransport,
}

#[async_trait::async_trait]
impl MailConnection for MemoryConnection {
    async fn verify(&mut self) -> Result<(), TransportError> {
        let mut state = self.transport.state();
        state.verifies += 1;
        if take_failure(&mut state.fail_verify) {
            return Err(TransportError::Verify("421 service not available".into()));
        }
        Ok(())
    }

    async fn send(&mut self, mail: &OutgoingMail) -> Result<SendReceipt, TransportError> {
        let mut state = self.transport.state();
        state.send_attempts += 1;

        if let Some(remaining) = state.fail_recipients.get_mut(&mail.to) {
            if take_failure(remaining) {
                return Err(TransportError::Send(format!(
                    "550 mailbox unavailable: {}",
                    mail.to
                )));
            }
        }

        let message_id = format!("{}@memory.local", uuid::Uuid::now_v7());
        state.sent.push(SentMail {
            mail: mail.clone(),
            message_id: message_id.clone(),
        });
        Ok(SendReceipt {
            message_id,
            response: "250 OK".into(),
        })
    }

    async fn close(self) -> Result<(), TransportError> {
        let mut state = self.transport.state();
        state.closes += 1;
        if state.fail_close {
            return Err(TransportError::Close("connection reset".into()));
        }
        Ok(())
    }
}
