//! Mail delivery transports
//!
//! The dispatcher renders bodies itself and hands finished messages to a
//! [`MailTransport`]. Transports make one attempt; the dispatcher never retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::error::SendError;

/// Resend-compatible HTTP API endpoint
pub const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// A rendered message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// HTML body
    pub html: String,
}

/// Mail sending collaborator
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    /// Deliver one message
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), SendError>;
}

/// Logs deliveries instead of sending them (development default)
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), SendError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            bytes = message.html.len(),
            "Email delivered (log transport)"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    html: &'a str,
}

/// Sends through a Resend-compatible HTTP API
#[derive(Clone)]
pub struct ResendTransport {
    http_client: Client,
    api_key: String,
    endpoint: String,
}

impl std::fmt::Debug for ResendTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResendTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ResendTransport {
    /// Transport for the public API
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, RESEND_API_URL)
    }

    /// Transport for a custom endpoint (self-hosted relay, tests)
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http_client,
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MailTransport for ResendTransport {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), SendError> {
        let request = ResendEmailRequest {
            from: &message.from,
            to: vec![&message.to],
            subject: &message.subject,
            html: &message.html,
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SendError::Rejected {
            status: status.as_u16(),
            message: body,
        })
    }
}

/// Captures messages in memory; optionally fails every delivery
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    sent: Arc<Mutex<Vec<OutgoingMessage>>>,
    fail_with: Option<SendError>,
}

impl MemoryTransport {
    /// Transport that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that rejects everything with `error`
    pub fn failing(error: SendError) -> Self {
        Self {
            sent: Arc::default(),
            fail_with: Some(error),
        }
    }

    /// Messages accepted so far
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), SendError> {
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}
