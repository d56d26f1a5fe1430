//! Webhook Entry Point
//!
//! ```text
//! raw body ─▶ verify ─▶ decode ─▶ decide ─▶ upsert ─▶ enqueue email ─▶ 200
//!               │                   │          │
//!               ▼                   ▼          ▼
//!              400            None: 200   error: 200 (Always) / 500 (AfterCommit, transient)
//! ```
//!
//! Everything up to and including the upsert runs on the request task; only
//! the email crosses into the dispatcher. The body is taken as `Bytes` so the
//! verifier sees exactly what was signed.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::error::{AuthError, GatewayError};
use crate::handlers::status::LatencyHistogram;
use crate::mailer::{EmailJob, Mailer};
use crate::stripe::events::{decode, DecodedEvent};
use crate::stripe::gateway::SubscriptionGateway;
use crate::stripe::signature::{SignatureVerifier, SIGNATURE_HEADER};
use crate::stripe::transition::{decide, StateTransition};

/// Route the provider posts to
pub const WEBHOOK_PATH: &str = "/webhooks/stripe";

/// Largest accepted webhook body (65 KiB)
pub const MAX_BODY_BYTES: usize = 65 << 10;

/// How to answer the provider when the upsert fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Always 200; failures are visible only in logs and counters
    #[default]
    Always,
    /// 500 on a transient upsert failure so the provider redelivers;
    /// permanent failures are still acknowledged
    AfterCommit,
}

impl FromStr for AckPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "after_commit" => Ok(Self::AfterCommit),
            other => Err(format!("unknown ack policy: {}", other)),
        }
    }
}

/// What happened to one authenticated event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Upsert committed
    Applied {
        /// User whose row changed
        user_id: Uuid,
        /// The committed transition
        transition: StateTransition,
        /// Whether a notification made it onto the queue
        notified: bool,
    },
    /// Unknown type or missing required field; nothing written
    Ignored,
    /// Upsert key matched no user; nothing written
    NotFound,
    /// Upsert failed
    PersistenceFailed(GatewayError),
}

impl WebhookOutcome {
    /// Whether the provider gets a 2xx under `policy`
    pub fn acknowledged(&self, policy: AckPolicy) -> bool {
        match self {
            Self::PersistenceFailed(e) => policy == AckPolicy::Always || !e.is_transient(),
            _ => true,
        }
    }
}

/// Webhook counters
#[derive(Debug, Default)]
pub struct WebhookStats {
    received: AtomicU64,
    rejected: AtomicU64,
    applied: AtomicU64,
    ignored: AtomicU64,
    not_found: AtomicU64,
    persistence_failures: AtomicU64,
    /// End-to-end handler latency
    pub latency: LatencyHistogram,
}

/// Point-in-time copy of [`WebhookStats`] counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookStatsSnapshot {
    /// Deliveries received
    pub received: u64,
    /// Deliveries failing authentication
    pub rejected: u64,
    /// Transitions committed
    pub applied: u64,
    /// Events with no transition
    pub ignored: u64,
    /// Transitions whose key matched no user
    pub not_found: u64,
    /// Failed upserts
    pub persistence_failures: u64,
}

impl WebhookStats {
    /// Current counters
    pub fn snapshot(&self) -> WebhookStatsSnapshot {
        WebhookStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &WebhookOutcome) {
        let counter = match outcome {
            WebhookOutcome::Applied { .. } => &self.applied,
            WebhookOutcome::Ignored => &self.ignored,
            WebhookOutcome::NotFound => &self.not_found,
            WebhookOutcome::PersistenceFailed(_) => &self.persistence_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared state for the webhook route
pub struct WebhookState {
    verifier: SignatureVerifier,
    gateway: Arc<dyn SubscriptionGateway>,
    mailer: Mailer,
    ack_policy: AckPolicy,
    stats: WebhookStats,
}

impl WebhookState {
    /// Assemble the pipeline
    pub fn new(
        verifier: SignatureVerifier,
        gateway: Arc<dyn SubscriptionGateway>,
        mailer: Mailer,
        ack_policy: AckPolicy,
    ) -> Self {
        Self {
            verifier,
            gateway,
            mailer,
            ack_policy,
            stats: WebhookStats::default(),
        }
    }

    /// Assemble the pipeline from configuration
    pub fn from_config(
        config: &WebhookConfig,
        gateway: Arc<dyn SubscriptionGateway>,
        mailer: Mailer,
    ) -> Self {
        Self::new(
            SignatureVerifier::new(config.secret.clone(), config.tolerance),
            gateway,
            mailer,
            config.ack_policy,
        )
    }

    /// Counters and latency
    pub fn stats(&self) -> &WebhookStats {
        &self.stats
    }

    /// The dispatcher notifications go to
    pub fn mailer(&self) -> &Mailer {
        &self.mailer
    }

    /// Active ack policy
    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    /// Authenticate and apply one delivery.
    ///
    /// `Err` only for authentication failures; those events are never decoded.
    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, AuthError> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let verified = match signature
            .ok_or(AuthError::MissingHeader)
            .and_then(|header| self.verifier.verify(raw_body, header))
        {
            Ok(event) => event,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("webhook_rejected_total").increment(1);
                warn!(error = %e, "Stripe webhook signature verification failed");
                return Err(e);
            }
        };

        let event = decode(verified);
        let label = if event.kind.is_known() {
            event.kind.as_str().to_string()
        } else {
            "unknown".to_string()
        };
        metrics::counter!("webhook_events_total", "type" => label).increment(1);

        let outcome = process_event(self.gateway.as_ref(), &self.mailer, &event).await;
        self.stats.record(&outcome);
        Ok(outcome)
    }
}

/// Decide, commit, and notify for one decoded event
pub async fn process_event(
    gateway: &dyn SubscriptionGateway,
    mailer: &Mailer,
    event: &DecodedEvent,
) -> WebhookOutcome {
    let Some(transition) = decide(event) else {
        return WebhookOutcome::Ignored;
    };

    let committed = match &transition {
        StateTransition::LinkCustomer {
            user_id,
            customer_id,
        } => gateway.upsert_customer_link(*user_id, customer_id).await,
        StateTransition::SetStatus {
            customer_id,
            subscription_id,
            status,
            ..
        } => {
            gateway
                .upsert_subscription(customer_id, subscription_id.as_deref(), *status)
                .await
        }
    };

    let user = match committed {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(
                event_id = %event.event_id,
                event_type = %event.kind,
                customer_id = %transition.customer_id(),
                "Dropping transition: no matching user"
            );
            return WebhookOutcome::NotFound;
        }
        Err(e) => {
            error!(
                event_id = %event.event_id,
                event_type = %event.kind,
                customer_id = %transition.customer_id(),
                error = %e,
                transient = e.is_transient(),
                "Failed to commit subscription transition"
            );
            return WebhookOutcome::PersistenceFailed(e);
        }
    };

    info!(
        event_id = %event.event_id,
        event_type = %event.kind,
        user_id = %user.user_id,
        status = %user.subscription_status,
        "Subscription transition committed"
    );

    let notified = match transition.notify() {
        Some(template) => mailer
            .enqueue(EmailJob::for_template(template, user.email.clone(), user.name.clone()))
            .is_ok(),
        None => false,
    };

    WebhookOutcome::Applied {
        user_id: user.user_id,
        transition,
        notified,
    }
}

/// `POST /webhooks/stripe`
pub async fn stripe_webhook_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let signature = match headers.get(SIGNATURE_HEADER).map(|v| v.to_str()) {
        None => None,
        Some(Ok(value)) => Some(value),
        Some(Err(_)) => {
            state.stats.received.fetch_add(1, Ordering::Relaxed);
            state.stats.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("webhook_rejected_total").increment(1);
            let err = AuthError::MalformedHeader("header is not valid UTF-8".to_string());
            warn!(error = %err, "Stripe webhook signature verification failed");
            return reject(&err);
        }
    };

    let response = match state.handle(&body, signature).await {
        Err(e) => reject(&e),
        Ok(outcome) if outcome.acknowledged(state.ack_policy) => {
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Ok(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "event not committed" })),
        )
            .into_response(),
    };

    state.stats.latency.record_duration(started.elapsed());
    response
}

fn reject(err: &AuthError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
    (
        status,
        Json(json!({ "error": "invalid stripe signature" })),
    )
        .into_response()
}

/// Router exposing the webhook route with its body limit
pub fn stripe_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(stripe_webhook_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::mailer::{MemoryTransport, Template};
    use crate::stripe::events::StripeEventType;
    use crate::stripe::gateway::{InMemorySubscriptionGateway, UserRecord};
    use crate::stripe::transition::SubscriptionStatus;
    use async_trait::async_trait;
    use std::time::Duration;

    const SECRET: &str = "whsec_test_secret";

    struct BrokenGateway;

    #[async_trait]
    impl SubscriptionGateway for BrokenGateway {
        async fn upsert_customer_link(
            &self,
            _user_id: Uuid,
            _customer_id: &str,
        ) -> Result<Option<UserRecord>, GatewayError> {
            Err(GatewayError::Unavailable("connection refused".into()))
        }
        async fn upsert_subscription(
            &self,
            _customer_id: &str,
            _subscription_id: Option<&str>,
            _status: SubscriptionStatus,
        ) -> Result<Option<UserRecord>, GatewayError> {
            Err(GatewayError::Unavailable("connection refused".into()))
        }
        async fn subscription_status(
            &self,
            _user_id: Uuid,
        ) -> Result<Option<SubscriptionStatus>, GatewayError> {
            Err(GatewayError::Unavailable("connection refused".into()))
        }
    }

    fn mailer() -> Mailer {
        Mailer::new(10, Arc::new(MemoryTransport::new()), "noreply@levelup.dev")
    }

    fn decoded(kind: &str, customer: Option<&str>) -> DecodedEvent {
        DecodedEvent {
            event_id: "evt_test".to_string(),
            kind: StripeEventType::parse(kind),
            customer_id: customer.map(String::from),
            subscription_id: None,
            client_reference_id: None,
            raw_payload: Vec::new(),
        }
    }

    fn state(gateway: Arc<dyn SubscriptionGateway>, policy: AckPolicy) -> WebhookState {
        WebhookState::new(
            SignatureVerifier::new(SECRET, Duration::from_secs(300)),
            gateway,
            mailer(),
            policy,
        )
    }

    fn signed(state: &WebhookState, body: &[u8]) -> String {
        state.verifier.sign(body, chrono::Utc::now().timestamp())
    }

    #[test]
    fn test_ack_policy_parsing() {
        assert_eq!("always".parse::<AckPolicy>(), Ok(AckPolicy::Always));
        assert_eq!("AFTER_COMMIT".parse::<AckPolicy>(), Ok(AckPolicy::AfterCommit));
        assert!("never".parse::<AckPolicy>().is_err());
    }

    #[test]
    fn test_acknowledgement_rules() {
        let failed = WebhookOutcome::PersistenceFailed(GatewayError::Unavailable("x".into()));
        assert!(failed.acknowledged(AckPolicy::Always));
        assert!(!failed.acknowledged(AckPolicy::AfterCommit));
        assert!(WebhookOutcome::NotFound.acknowledged(AckPolicy::AfterCommit));
        let conflict = WebhookOutcome::PersistenceFailed(GatewayError::Conflict("x".into()));
        assert!(conflict.acknowledged(AckPolicy::AfterCommit));
        assert!(WebhookOutcome::Ignored.acknowledged(AckPolicy::AfterCommit));
    }

    #[test]
    fn test_rejection_status_follows_auth_error() {
        for err in [
            AuthError::MissingHeader,
            AuthError::MalformedHeader("t=".into()),
            AuthError::InvalidSignature,
            AuthError::StaleTimestamp { age_secs: 900 },
            AuthError::InvalidPayload("eof".into()),
        ] {
            assert_eq!(reject(&err).status().as_u16(), err.status_code());
        }
    }

    #[tokio::test]
    async fn test_payment_failed_enqueues_one_email() {
        let store = InMemorySubscriptionGateway::new();
        let mut user = UserRecord::new(Uuid::new_v4(), "grace@example.com", "Grace");
        user.stripe_customer_id = Some("cus_1".to_string());
        store.insert_user(user.clone());
        let mailer = mailer();

        let outcome =
            process_event(&store, &mailer, &decoded("invoice.payment_failed", Some("cus_1"))).await;

        match outcome {
            WebhookOutcome::Applied {
                user_id, notified, ..
            } => {
                assert_eq!(user_id, user.user_id);
                assert!(notified);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            store.get_user(user.user_id).unwrap().subscription_status,
            SubscriptionStatus::PastDue
        );
        assert_eq!(mailer.stats().enqueued, 1);
        assert_eq!(mailer.stats().queued, 1);
        assert_eq!(Template::PaymentFailed.name(), "payment_failed");
    }

    #[tokio::test]
    async fn test_unknown_customer_is_not_found() {
        let store = InMemorySubscriptionGateway::new();
        let mailer = mailer();
        let outcome =
            process_event(&store, &mailer, &decoded("invoice.payment_failed", Some("cus_x"))).await;
        assert_eq!(outcome, WebhookOutcome::NotFound);
        assert_eq!(mailer.stats().enqueued, 0);
    }

    #[tokio::test]
    async fn test_missing_field_makes_no_write() {
        let store = InMemorySubscriptionGateway::new();
        let outcome =
            process_event(&store, &mailer(), &decoded("invoice.payment_failed", None)).await;
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_rejects_missing_and_bad_signatures() {
        let state = state(Arc::new(InMemorySubscriptionGateway::new()), AckPolicy::Always);
        let body = br#"{"type":"something.new"}"#;

        assert_eq!(state.handle(body, None).await, Err(AuthError::MissingHeader));
        assert_eq!(
            state.handle(body, Some("t=1,v1=00")).await,
            Err(AuthError::InvalidSignature)
        );
        assert_eq!(state.stats().snapshot().rejected, 2);
    }

    #[tokio::test]
    async fn test_handle_persistence_failure() {
        let state = state(Arc::new(BrokenGateway), AckPolicy::AfterCommit);
        let body = br#"{"id":"evt_1","type":"customer.subscription.deleted","data":{"object":{"id":"sub_1","customer":"cus_1"}}}"#;
        let header = signed(&state, body);

        let outcome = state.handle(body, Some(&header)).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::PersistenceFailed(_)));
        assert!(!outcome.acknowledged(state.ack_policy()));
        assert_eq!(state.stats().snapshot().persistence_failures, 1);
    }
}
