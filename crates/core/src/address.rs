//! Recipient address value object.
//!
//! Only a syntactic sanity check lives here: enough to keep obviously broken
//! rows out of the queue. The SMTP relay remains the authority on whether an
//! address is deliverable.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A syntactically plausible email address (`local@domain`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("email address is empty"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(DomainError::validation(format!(
                "email address contains whitespace: {trimmed}"
            )));
        }

        let Some((local, domain)) = trimmed.split_once('@') else {
            return Err(DomainError::validation(format!(
                "email address is missing '@': {trimmed}"
            )));
        };
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(DomainError::validation(format!(
                "malformed email address: {trimmed}"
            )));
        }
        if !(domain.contains('.') || domain.eq_ignore_ascii_case("localhost"))
            || domain.starts_with('.')
            || domain.ends_with('.')
        {
            return Err(DomainError::validation(format!(
                "malformed email domain: {domain}"
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Domain part (after `@`).
    pub fn domain(&self) -> &str {
        self.0.split_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl core::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EmailAddress> for String {
    fn from(value: EmailAddress) -> Self {
        value.0
    }
}

impl core::str::FromStr for EmailAddress {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
