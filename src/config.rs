//! Environment configuration
//!
//! All settings come from environment variables, optionally seeded from a
//! `.env` file. Secrets are held in memory only and never logged.
//!
//! - `STRIPE_WEBHOOK_SECRET` (required): webhook signing secret
//! - `STRIPE_WEBHOOK_TOLERANCE_SECS`: accepted signature age (default: 300)
//! - `WEBHOOK_ACK_POLICY`: `always` or `after_commit` (default: `always`)
//! - `MAILER_QUEUE_CAPACITY`: bounded mail queue size (default: 100)
//! - `MAILER_WORKERS`: mail worker count (default: 3)
//! - `EMAIL_FROM`: sender address (default: `noreply@levelup.dev`)
//! - `RESEND_API_KEY`: enables the HTTP mail transport when set
//! - `LEVELUP_BIND_ALL`: set to "true" to bind 0.0.0.0 (containers)
//! - `PORT`: listen port (default: 8080)

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ConfigError;
use crate::stripe::AckPolicy;

/// Default signature tolerance, matching the provider's client libraries
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Default mail queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default mail worker count
pub const DEFAULT_WORKERS: usize = 3;

/// Default sender address
pub const DEFAULT_EMAIL_FROM: &str = "noreply@levelup.dev";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Webhook verification settings
#[derive(Clone)]
pub struct WebhookConfig {
    /// Signing secret shared with the provider
    pub secret: String,
    /// Maximum accepted age of a signed timestamp
    pub tolerance: Duration,
    /// How persistence failures are acknowledged
    pub ack_policy: AckPolicy,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &"[redacted]")
            .field("tolerance", &self.tolerance)
            .field("ack_policy", &self.ack_policy)
            .finish()
    }
}

/// Notification dispatcher settings
#[derive(Clone)]
pub struct MailerConfig {
    /// Bounded queue capacity
    pub queue_capacity: usize,
    /// Number of long-lived workers
    pub workers: usize,
    /// Sender address
    pub from: String,
    /// API key for the HTTP transport; `None` selects the log transport
    pub resend_api_key: Option<String>,
}

impl std::fmt::Debug for MailerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailerConfig")
            .field("queue_capacity", &self.queue_capacity)
            .field("workers", &self.workers)
            .field("from", &self.from)
            .field("resend_api_key", &self.resend_api_key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Complete service configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Webhook settings
    pub webhook: WebhookConfig,
    /// Mailer settings
    pub mailer: MailerConfig,
    /// Address to bind
    pub bind_addr: IpAddr,
    /// Port to listen on
    pub port: u16,
}

impl AppConfig {
    /// Load configuration from the process environment (and `.env`, if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup("STRIPE_WEBHOOK_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?;

        if !secret.starts_with("whsec_") {
            warn!("STRIPE_WEBHOOK_SECRET does not look like a webhook signing secret");
        }

        let tolerance_secs = parse_or(
            &lookup,
            "STRIPE_WEBHOOK_TOLERANCE_SECS",
            DEFAULT_TOLERANCE_SECS,
        )?;

        let ack_policy = match lookup("WEBHOOK_ACK_POLICY") {
            None => AckPolicy::default(),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "WEBHOOK_ACK_POLICY",
                value: raw,
            })?,
        };

        let queue_capacity = parse_nonzero(&lookup, "MAILER_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;
        let workers = parse_nonzero(&lookup, "MAILER_WORKERS", DEFAULT_WORKERS)?;

        let from = lookup("EMAIL_FROM")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string());

        let resend_api_key = lookup("RESEND_API_KEY").filter(|s| !s.is_empty());

        let bind_all = lookup("LEVELUP_BIND_ALL")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let bind_addr = if bind_all {
            warn!("Binding to 0.0.0.0 (LEVELUP_BIND_ALL=true)");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };

        let port = parse_or(&lookup, "PORT", DEFAULT_PORT)?;

        info!(
            tolerance_secs,
            ack_policy = ?ack_policy,
            queue_capacity,
            workers,
            http_mail = resend_api_key.is_some(),
            "Configuration loaded"
        );

        Ok(Self {
            webhook: WebhookConfig {
                secret,
                tolerance: Duration::from_secs(tolerance_secs),
                ack_policy,
            },
            mailer: MailerConfig {
                queue_capacity,
                workers,
                from,
                resend_api_key,
            },
            bind_addr,
            port,
        })
    }

    /// Configuration for tests
    pub fn test_config() -> Self {
        Self {
            webhook: WebhookConfig {
                secret: "whsec_test_secret".to_string(),
                tolerance: Duration::from_secs(DEFAULT_TOLERANCE_SECS),
                ack_policy: AckPolicy::Always,
            },
            mailer: MailerConfig {
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                workers: DEFAULT_WORKERS,
                from: DEFAULT_EMAIL_FROM.to_string(),
                resend_api_key: None,
            },
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
        }
    }

    /// Socket address to listen on
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn parse_nonzero<F>(lookup: &F, key: &'static str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        });
    }
    Ok(value)
}
