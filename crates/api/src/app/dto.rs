use serde::{Deserialize, Serialize};

use ledermail_core::{DomainResult, EmailAddress, NewEmail};
use ledermail_infra::CycleReport;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueEmailRequest {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub metadata: Option<serde_json::Value>,
}

impl EnqueueEmailRequest {
    pub fn into_new_email(self) -> DomainResult<NewEmail> {
        let to = EmailAddress::parse(&self.to_email)?;
        let mut email = NewEmail::new(to, self.subject, self.body)?;
        if let Some(name) = self.to_name {
            email = email.with_name(name);
        }
        if let Some(metadata) = self.metadata {
            email = email.with_metadata(metadata);
        }
        Ok(email)
    }
}

#[derive(Debug, Deserialize)]
pub struct TestEmailRequest {
    pub to_email: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

impl ListQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 500;

    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub message: &'static str,
    pub report: CycleReport,
}

impl ProcessResponse {
    pub fn new(report: CycleReport) -> Self {
        Self {
            message: "Email queue processed successfully.",
            report,
        }
    }
}
