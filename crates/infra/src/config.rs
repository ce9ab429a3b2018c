//! Configuration loading and representation.
//!
//! Everything is read from environment variables (a `.env` file is honored by
//! [`AppConfig::from_env`]). Parsing is implemented over a lookup function so
//! it can be exercised without touching the process environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use ledermail_core::RetryPolicy;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// How the SMTP session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain text session.
    None,
    /// Upgrade with STARTTLS when the server offers it.
    #[default]
    StartTls,
    /// STARTTLS is mandatory.
    Required,
    /// Implicit TLS from the first byte (usually port 465).
    Wrapper,
}

impl FromStr for TlsMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "plain" => Ok(TlsMode::None),
            "starttls" | "opportunistic" => Ok(TlsMode::StartTls),
            "required" | "starttls-required" => Ok(TlsMode::Required),
            "wrapper" | "implicit" | "tls" | "ssl" => Ok(TlsMode::Wrapper),
            _ => Err(()),
        }
    }
}

/// SMTP relay settings.
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_name: String,
    pub from_address: String,
    pub tls: TlsMode,
    pub accept_invalid_certs: bool,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,
    pub socket_timeout: Duration,
}

impl core::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("from_name", &self.from_name)
            .field("from_address", &self.from_address)
            .field("tls", &self.tls)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("connect_timeout", &self.connect_timeout)
            .field("greeting_timeout", &self.greeting_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .finish()
    }
}

impl SmtpConfig {
    pub const DEFAULT_FROM_NAME: &'static str = "Johanna Lederwaren";

    /// Minimal config for a relay on `host:port` (no auth, STARTTLS if offered).
    pub fn new(host: impl Into<String>, port: u16, from_address: impl Into<String>) -> Self {
        let timeout = Duration::from_millis(5000);
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            from_name: Self::DEFAULT_FROM_NAME.to_string(),
            from_address: from_address.into(),
            tls: TlsMode::default(),
            accept_invalid_certs: false,
            connect_timeout: timeout,
            greeting_timeout: timeout,
            socket_timeout: timeout,
        }
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = non_empty(&lookup, "SMTP_HOST").ok_or(ConfigError::Missing("SMTP_HOST"))?;
        let username = non_empty(&lookup, "SMTP_USER");
        let from_address = non_empty(&lookup, "SMTP_FROM")
            .or_else(|| username.clone())
            .ok_or(ConfigError::Missing("SMTP_FROM"))?;

        Ok(Self {
            host,
            port: parse_or(&lookup, "SMTP_PORT", 587)?,
            username,
            password: lookup("SMTP_PASS").filter(|p| !p.is_empty()),
            from_name: non_empty(&lookup, "SMTP_FROM_NAME")
                .unwrap_or_else(|| Self::DEFAULT_FROM_NAME.to_string()),
            from_address,
            tls: parse_or(&lookup, "SMTP_TLS", TlsMode::default())?,
            accept_invalid_certs: parse_bool_or(&lookup, "SMTP_ACCEPT_INVALID_CERTS", false)?,
            connect_timeout: millis_or(&lookup, "SMTP_CONNECT_TIMEOUT_MS", 5000)?,
            greeting_timeout: millis_or(&lookup, "SMTP_GREETING_TIMEOUT_MS", 5000)?,
            socket_timeout: millis_or(&lookup, "SMTP_SOCKET_TIMEOUT_MS", 5000)?,
        })
    }
}

/// Queue worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Jobs fetched per cycle.
    pub batch_size: usize,
    /// Claims allowed per job before it is left `failed` for good.
    pub max_attempts: u32,
    /// Sleep between two sends of the same batch.
    pub pacing_delay: Duration,
    /// Delay before a failed job is eligible again.
    pub queue_backoff: RetryPolicy,
    /// Immediate retries inside one send.
    pub send_retry: RetryPolicy,
    /// Connect + verify retries when opening the batch connection.
    pub connect_retry: RetryPolicy,
    /// Also fetch `failed` rows that still have attempts left.
    pub retry_failed: bool,
    /// Requeue rows stuck in `processing` for longer than this.
    pub stale_after: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_attempts: 3,
            pacing_delay: Duration::from_millis(2000),
            queue_backoff: RetryPolicy::queue(),
            send_retry: RetryPolicy::transport(),
            connect_retry: RetryPolicy::transport(),
            retry_failed: false,
            stale_after: None,
        }
    }
}

impl WorkerConfig {
    /// Same limits, no sleeping anywhere except the queue-level backoff.
    pub fn without_delays(self) -> Self {
        Self {
            pacing_delay: Duration::ZERO,
            send_retry: self.send_retry.without_delay(),
            connect_retry: self.connect_retry.without_delay(),
            ..self
        }
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let batch_size: usize = parse_or(&lookup, "EMAIL_QUEUE_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(invalid("EMAIL_QUEUE_BATCH_SIZE", "0"));
        }
        let max_attempts: u32 =
            parse_or(&lookup, "EMAIL_QUEUE_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("EMAIL_QUEUE_MAX_ATTEMPTS", "0"));
        }
        let send_retries: u32 = parse_or(
            &lookup,
            "EMAIL_QUEUE_SEND_RETRIES",
            defaults.send_retry.max_attempts,
        )?;
        if send_retries == 0 {
            return Err(invalid("EMAIL_QUEUE_SEND_RETRIES", "0"));
        }

        let stale_after = match non_empty(&lookup, "EMAIL_QUEUE_STALE_AFTER_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if (1..=MAX_STALE_AFTER_SECS).contains(&secs) => {
                    Some(Duration::from_secs(secs))
                }
                _ => return Err(invalid("EMAIL_QUEUE_STALE_AFTER_SECS", &raw)),
            },
            None => None,
        };

        Ok(Self {
            batch_size,
            max_attempts,
            pacing_delay: millis_or(
                &lookup,
                "EMAIL_QUEUE_PACING_MS",
                defaults.pacing_delay.as_millis() as u64,
            )?,
            queue_backoff: RetryPolicy {
                max_attempts,
                ..defaults.queue_backoff
            },
            send_retry: RetryPolicy {
                max_attempts: send_retries,
                ..defaults.send_retry
            },
            connect_retry: defaults.connect_retry,
            retry_failed: parse_bool_or(&lookup, "EMAIL_QUEUE_RETRY_FAILED", false)?,
            stale_after,
        })
    }
}

/// Long-running loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs: u64 = parse_or(&lookup, "EMAIL_QUEUE_POLL_INTERVAL_SECS", 30)?;
        if secs == 0 {
            return Err(invalid("EMAIL_QUEUE_POLL_INTERVAL_SECS", "0"));
        }
        Ok(Self {
            poll_interval: Duration::from_secs(secs),
        })
    }
}

/// Full process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Postgres URL; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub listen_addr: SocketAddr,
    pub smtp: SmtpConfig,
    pub worker: WorkerConfig,
    pub runner: RunnerConfig,
}

impl AppConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Just `DATABASE_URL` (schema migration needs nothing else).
    pub fn database_url_from_env() -> Result<String, ConfigError> {
        dotenvy::dotenv().ok();
        non_empty(&|key: &str| std::env::var(key).ok(), "DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = parse_or(
            &lookup,
            "LISTEN_ADDR",
            SocketAddr::from(([0, 0, 0, 0], 8080)),
        )?;

        Ok(Self {
            database_url: non_empty(&lookup, "DATABASE_URL"),
            listen_addr,
            smtp: SmtpConfig::from_lookup(&lookup)?,
            worker: WorkerConfig::from_lookup(&lookup)?,
            runner: RunnerConfig::from_lookup(&lookup)?,
        })
    }
}

/// Upper bound for `EMAIL_QUEUE_STALE_AFTER_SECS`: 30 days.
const MAX_STALE_AFTER_SECS: u64 = 30 * 24 * 60 * 60;

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match non_empty(lookup, key) {
        Some(raw) => raw.parse().map_err(|_| invalid(key, &raw)),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &raw)),
        },
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_required_keys_are_set() {
        let cfg = AppConfig::from_lookup(env(&[
            ("SMTP_HOST", "smtp.example.at"),
            ("SMTP_USER", "noreply@example.at"),
        ]))
        .unwrap();

        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.smtp.port, 587);
        assert_eq!(cfg.smtp.from_address, "noreply@example.at");
        assert_eq!(cfg.smtp.from_name, "Johanna Lederwaren");
        assert_eq!(cfg.smtp.tls, TlsMode::StartTls);
        assert!(!cfg.smtp.accept_invalid_certs);
        assert_eq!(cfg.smtp.socket_timeout, Duration::from_secs(5));
        assert_eq!(cfg.worker, WorkerConfig::default());
        assert_eq!(cfg.worker.batch_size, 5);
        assert_eq!(cfg.worker.max_attempts, 3);
        assert_eq!(cfg.runner.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = AppConfig::from_lookup(env(&[
            ("SMTP_HOST", "smtp.example.at"),
            ("SMTP_PORT", "465"),
            ("SMTP_FROM", "shop@example.at"),
            ("SMTP_FROM_NAME", "Lederwaren"),
            ("SMTP_PASS", "secret"),
            ("SMTP_TLS", "wrapper"),
            ("SMTP_ACCEPT_INVALID_CERTS", "yes"),
            ("EMAIL_QUEUE_BATCH_SIZE", "10"),
            ("EMAIL_QUEUE_MAX_ATTEMPTS", "5"),
            ("EMAIL_QUEUE_PACING_MS", "1000"),
            ("EMAIL_QUEUE_RETRY_FAILED", "true"),
            ("EMAIL_QUEUE_STALE_AFTER_SECS", "900"),
            ("DATABASE_URL", "postgres://localhost/shop"),
        ]))
        .unwrap();

        assert_eq!(cfg.smtp.port, 465);
        assert_eq!(cfg.smtp.tls, TlsMode::Wrapper);
        assert!(cfg.smtp.accept_invalid_certs);
        assert_eq!(cfg.smtp.from_name, "Lederwaren");
        assert_eq!(cfg.worker.batch_size, 10);
        assert_eq!(cfg.worker.max_attempts, 5);
        assert_eq!(cfg.worker.queue_backoff.max_attempts, 5);
        assert_eq!(cfg.worker.pacing_delay, Duration::from_secs(1));
        assert!(cfg.worker.retry_failed);
        assert_eq!(cfg.worker.stale_after, Some(Duration::from_secs(900)));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/shop"));
    }

    #[test]
    fn missing_host_is_reported() {
        let err = SmtpConfig::from_lookup(env(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SMTP_HOST"));

        let err = SmtpConfig::from_lookup(env(&[("SMTP_HOST", "h")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SMTP_FROM"));
    }

    #[test]
    fn garbage_values_are_rejected() {
        let base = [("SMTP_HOST", "h"), ("SMTP_FROM", "a@b.at")];

        for (key, value) in [
            ("SMTP_PORT", "not-a-port"),
            ("SMTP_TLS", "maybe"),
            ("EMAIL_QUEUE_BATCH_SIZE", "0"),
            ("EMAIL_QUEUE_MAX_ATTEMPTS", "0"),
            ("EMAIL_QUEUE_RETRY_FAILED", "perhaps"),
            ("EMAIL_QUEUE_POLL_INTERVAL_SECS", "0"),
            ("EMAIL_QUEUE_STALE_AFTER_SECS", "-5"),
        ] {
            let mut pairs = base.to_vec();
            pairs.push((key, value));
            let err = AppConfig::from_lookup(env(&pairs)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: k, .. } if k == key),
                "{key}={value} gave {err:?}"
            );
        }
    }

    #[test]
    fn stale_after_must_be_between_one_second_and_thirty_days() {
        let base = [("SMTP_HOST", "h"), ("SMTP_FROM", "a@b.at")];
        let parse = |value: &str| {
            let mut pairs = base.to_vec();
            pairs.push(("EMAIL_QUEUE_STALE_AFTER_SECS", value));
            AppConfig::from_lookup(env(&pairs)).map(|cfg| cfg.worker.stale_after)
        };

        assert_eq!(parse("1").unwrap(), Some(Duration::from_secs(1)));
        assert_eq!(parse("2592000").unwrap(), Some(Duration::from_secs(2_592_000)));

        for value in ["0", "2592001", "10000000000000", "18446744073709551615"] {
            let err = parse(value).unwrap_err();
            assert_eq!(
                err,
                ConfigError::Invalid {
                    key: "EMAIL_QUEUE_STALE_AFTER_SECS",
                    value: value.to_string(),
                },
                "stale_after={value}"
            );
        }
    }

    #[test]
    fn debug_output_hides_the_password() {
        let mut cfg = SmtpConfig::new("h", 25, "a@b.at");
        cfg.password = Some("hunter2".into());
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn without_delays_keeps_budgets() {
        let cfg = WorkerConfig::default().without_delays();
        assert_eq!(cfg.pacing_delay, Duration::ZERO);
        assert_eq!(cfg.send_retry.max_attempts, 3);
        assert_eq!(cfg.send_retry.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(cfg.queue_backoff, RetryPolicy::queue());
    }
}
