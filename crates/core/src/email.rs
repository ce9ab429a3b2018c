//! Queued email jobs and their status lifecycle.
//!
//! ```text
//! pending ──claim──▶ processing ──ok──▶ sent
//!                        │
//!                        └──error──▶ failed (next_attempt_at = now + backoff)
//! ```
//!
//! A `failed` job whose `attempts` reached the configured maximum is
//! exhausted: it keeps its `failed` status but no fetch predicate matches it
//! any more.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::EmailAddress;
use crate::error::{DomainError, DomainResult};
use crate::id::EmailJobId;

/// Status of a queued email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    /// Waiting to be picked up.
    Pending,
    /// Claimed by a worker, send in flight.
    Processing,
    /// Delivered to the relay.
    Sent,
    /// Last attempt failed; see `error` and `next_attempt_at`.
    Failed,
}

impl EmailStatus {
    pub const ALL: [EmailStatus; 4] = [
        EmailStatus::Pending,
        EmailStatus::Processing,
        EmailStatus::Sent,
        EmailStatus::Failed,
    ];

    /// Column representation in `email_queue.status`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Processing => "processing",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EmailStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmailStatus::Pending),
            "processing" => Ok(EmailStatus::Processing),
            "sent" => Ok(EmailStatus::Sent),
            "failed" => Ok(EmailStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// A request to queue an email (what producers such as order confirmation
/// or registration hand to the store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEmail {
    pub to_email: EmailAddress,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
    /// Producer-defined context, e.g. `{"type": "order_confirmation", "order_id": "..."}`.
    pub metadata: serde_json::Value,
}

impl NewEmail {
    pub fn new(
        to_email: EmailAddress,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> DomainResult<Self> {
        let subject = subject.into();
        if subject.trim().is_empty() {
            return Err(DomainError::validation("subject must not be empty"));
        }

        Ok(Self {
            to_email,
            to_name: None,
            subject,
            body: body.into(),
            metadata: serde_json::Value::Null,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.to_name = (!name.trim().is_empty()).then_some(name);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The settings page's "send test email" message.
    pub fn test_email(to_email: EmailAddress, shop_name: &str) -> Self {
        Self {
            to_email,
            to_name: None,
            subject: format!("Test E-Mail von {shop_name}"),
            body: "Dies ist eine Test-E-Mail um die E-Mail-Einstellungen zu überprüfen."
                .to_string(),
            metadata: serde_json::json!({ "type": "test_email" }),
        }
    }
}

/// One row of the email queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: EmailJobId,
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub status: EmailStatus,
    /// Delivery attempts made so far (incremented at claim time).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl EmailJob {
    /// Materialize a freshly queued job: pending, never tried, eligible now.
    pub fn new(email: NewEmail, now: DateTime<Utc>) -> Self {
        Self {
            id: EmailJobId::new(),
            to_email: email.to_email.into(),
            to_name: email.to_name,
            subject: email.subject,
            body: email.body,
            metadata: email.metadata,
            status: EmailStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            next_attempt_at: now,
            sent_at: None,
            error: None,
        }
    }

    /// Whether the row may be claimed, ignoring the schedule.
    pub fn is_claimable(&self, max_attempts: u32, include_failed: bool) -> bool {
        let status_ok = match self.status {
            EmailStatus::Pending => true,
            EmailStatus::Failed => include_failed,
            EmailStatus::Processing | EmailStatus::Sent => false,
        };
        status_ok && self.attempts < max_attempts
    }

    /// Fetch predicate: claimable and due.
    pub fn is_eligible(&self, now: DateTime<Utc>, max_attempts: u32, include_failed: bool) -> bool {
        self.is_claimable(max_attempts, include_failed) && self.next_attempt_at <= now
    }

    /// Failed with no attempts left; never fetched again.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.status == EmailStatus::Failed && self.attempts >= max_attempts
    }

    /// Apply a partial update, stamping `updated_at`.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(sent_at) = update.sent_at {
            self.sent_at = sent_at;
        }
        if let Some(error) = &update.error {
            self.error = error.clone();
        }
        if let Some(next_attempt_at) = update.next_attempt_at {
            self.next_attempt_at = next_attempt_at;
        }
        self.updated_at = now;
    }
}

/// Partial update of the worker-owned lifecycle fields.
///
/// `None` leaves a column untouched; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: Option<EmailStatus>,
    pub attempts: Option<u32>,
    pub sent_at: Option<Option<DateTime<Utc>>>,
    pub error: Option<Option<String>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    /// Claim transition: in flight, one more attempt counted.
    pub fn claim(attempts: u32) -> Self {
        Self {
            status: Some(EmailStatus::Processing),
            attempts: Some(attempts),
            ..Default::default()
        }
    }

    /// Delivery succeeded.
    pub fn sent(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(EmailStatus::Sent),
            sent_at: Some(Some(at)),
            error: Some(None),
            ..Default::default()
        }
    }

    /// Delivery failed; eligible again from `next_attempt_at`.
    pub fn failed(error: impl Into<String>, next_attempt_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(EmailStatus::Failed),
            sent_at: Some(None),
            error: Some(Some(error.into())),
            next_attempt_at: Some(next_attempt_at),
            ..Default::default()
        }
    }

    /// Put a stuck `processing` row back in line.
    pub fn requeue() -> Self {
        Self {
            status: Some(EmailStatus::Pending),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> EmailJob {
        let email = NewEmail::new(
            EmailAddress::parse("kunde@example.at").unwrap(),
            "Ihre Bestellung",
            "Danke für Ihre Bestellung.",
        )
        .unwrap();
        EmailJob::new(email, Utc::now())
    }

    #[test]
    fn new_job_is_pending_and_due() {
        let job = job();

        assert_eq!(job.status, EmailStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.next_attempt_at, job.created_at);
        assert!(job.sent_at.is_none());
        assert!(job.is_eligible(job.created_at, 3, false));
    }

    #[test]
    fn eligibility_guards() {
        let now = Utc::now();

        let mut future = job();
        future.next_attempt_at = now + chrono::Duration::seconds(1);
        assert!(!future.is_eligible(now, 3, false));

        let mut spent = job();
        spent.attempts = 3;
        assert!(!spent.is_eligible(now, 3, false));

        let mut failed = job();
        failed.status = EmailStatus::Failed;
        failed.attempts = 1;
        assert!(!failed.is_eligible(now, 3, false));
        assert!(failed.is_eligible(now, 3, true));

        for status in [EmailStatus::Processing, EmailStatus::Sent] {
            let mut j = job();
            j.status = status;
            assert!(!j.is_eligible(now, 3, true));
        }
    }

    #[test]
    fn success_clears_previous_error() {
        let mut job = job();
        let now = Utc::now();
        job.apply(&JobUpdate::failed("relay said no", now), now);
        assert_eq!(job.error.as_deref(), Some("relay said no"));

        job.apply(&JobUpdate::sent(now), now);
        assert_eq!(job.status, EmailStatus::Sent);
        assert_eq!(job.sent_at, Some(now));
        assert!(job.error.is_none());
    }

    #[test]
    fn exhausted_means_failed_without_budget() {
        let mut job = job();
        job.status = EmailStatus::Failed;
        job.attempts = 3;
        assert!(job.is_exhausted(3));

        job.attempts = 2;
        assert!(!job.is_exhausted(3));
    }

    #[test]
    fn status_round_trips_through_column_text() {
        for status in EmailStatus::ALL {
            assert_eq!(status.as_str().parse::<EmailStatus>().unwrap(), status);
        }
        assert!(matches!(
            "exhausted".parse::<EmailStatus>(),
            Err(DomainError::UnknownStatus(_))
        ));
    }

    #[test]
    fn empty_subject_is_rejected() {
        let to = EmailAddress::parse("a@example.com").unwrap();
        assert!(NewEmail::new(to, "   ", "body").is_err());
    }

    #[test]
    fn test_email_is_tagged() {
        let to = EmailAddress::parse("a@example.com").unwrap();
        let email = NewEmail::test_email(to, "Johanna Lederwaren");
        assert_eq!(email.subject, "Test E-Mail von Johanna Lederwaren");
        assert_eq!(email.metadata["type"], "test_email");
    }
}
