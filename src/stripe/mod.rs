//! Stripe Webhook Reconciliation
//!
//! Turns provider webhook deliveries into subscription state on the user
//! record, and queues the emails some transitions call for.
//!
//! - **Signature Verification**: HMAC-SHA256 over `"{t}.{raw_body}"`, checked
//!   against every `v1` entry of the `Stripe-Signature` header
//! - **Decoding**: a verified envelope becomes a small typed [`DecodedEvent`]
//! - **State Machine**: [`decide`] maps an event to at most one persistence call
//! - **Persistence**: idempotent upserts through a [`SubscriptionGateway`]
//!
//! # Architecture
//!
//! ```text
//! Request -> Signature Verify -> Decode -> Decide -> Upsert -> Enqueue Email -> Ack (200)
//!                   |                        |          |
//!                   v                        v          v
//!                  400                  ignored: 200  failed: 200 / 500 (AckPolicy)
//! ```
//!
//! Redelivery is harmless: every write is a keyed upsert whose result depends
//! only on the event, so there is no idempotency store.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use levelup_billing::config::AppConfig;
//! use levelup_billing::mailer::{LogTransport, Mailer};
//! use levelup_billing::stripe::{stripe_webhook_router, InMemorySubscriptionGateway, WebhookState};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AppConfig::from_env()?;
//! let mailer = Mailer::spawn(100, 3, Arc::new(LogTransport), "noreply@levelup.dev");
//! let gateway = Arc::new(InMemorySubscriptionGateway::new());
//! let state = Arc::new(WebhookState::from_config(&config.webhook, gateway, mailer));
//!
//! let app = stripe_webhook_router(state);
//! // ... serve with axum
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod gateway;
pub mod handler;
pub mod signature;
pub mod transition;

pub use events::{decode, DecodedEvent, EventData, StripeEventType, VerifiedEvent};
pub use gateway::{
    ensure_active, AccessError, InMemorySubscriptionGateway, SubscriptionGateway, UserRecord,
};
pub use handler::{
    process_event, stripe_webhook_handler, stripe_webhook_router, AckPolicy, WebhookOutcome,
    WebhookState, WebhookStats, WebhookStatsSnapshot, MAX_BODY_BYTES, WEBHOOK_PATH,
};
pub use signature::{compute_signature, SignatureHeader, SignatureVerifier, SIGNATURE_HEADER};
pub use transition::{decide, StateTransition, SubscriptionStatus};
