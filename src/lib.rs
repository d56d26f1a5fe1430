//! Level Up Billing - Subscription Reconciliation Backend
//!
//! Receives payment-provider webhooks, verifies them, applies the resulting
//! subscription transition to the user record, and sends the emails those
//! transitions call for without ever blocking the webhook response.
//!
//! # Features
//!
//! - **Webhook Verification**: HMAC-SHA256 signatures with a replay window
//! - **Reconciliation**: idempotent, event-keyed subscription upserts
//! - **Access Control**: [`stripe::ensure_active`] for paid routes
//! - **Email Dispatch**: bounded queue, fixed worker pool, drop on overflow
//!
//! # Architecture
//!
//! ```text
//! Provider ──▶ POST /webhooks/stripe ──▶ Verifier ──▶ Decoder ──▶ State Machine
//!                                                                     │
//!                                                                     ▼
//!                                     ┌──────────────┐        ┌──────────────┐
//!                                     │ Mail Workers │ ◀───── │   Gateway    │
//!                                     └──────┬───────┘ queue  └──────────────┘
//!                                            │
//!                                            ▼
//!                                     Mail Transport
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use levelup_billing::config::AppConfig;
//! use levelup_billing::handlers::AppState;
//! use levelup_billing::mailer::{LogTransport, Mailer};
//! use levelup_billing::stripe::{InMemorySubscriptionGateway, WebhookState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_env()?;
//!     let mailer = Mailer::spawn(
//!         config.mailer.queue_capacity,
//!         config.mailer.workers,
//!         Arc::new(LogTransport),
//!         config.mailer.from.clone(),
//!     );
//!     let gateway = Arc::new(InMemorySubscriptionGateway::new());
//!     let webhook = Arc::new(WebhookState::from_config(&config.webhook, gateway, mailer.clone()));
//!
//!     let listener = tokio::net::TcpListener::bind(config.socket_addr()).await?;
//!     axum::serve(listener, levelup_billing::app(Arc::new(AppState::new(webhook)))).await?;
//!
//!     mailer.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod handlers;
pub mod mailer;
pub mod stripe;

// Re-exports for convenience
pub use config::AppConfig;
pub use error::{Error, Result};
pub use handlers::AppState;
pub use mailer::{EmailJob, Mailer};
pub use stripe::{SubscriptionGateway, WebhookState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Full HTTP surface: the webhook route plus health and status routes
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(stripe::stripe_webhook_router(state.webhook().clone()))
        .merge(handlers::status_router(state))
        .layer(TraceLayer::new_for_http())
}
