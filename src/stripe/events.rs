//! Stripe Event Types
//!
//! The provider's object schemas are far larger than what reconciliation
//! needs, so the envelope is parsed once into a [`VerifiedEvent`] holding the
//! event type and an open JSON view of `data.object`, and [`decode`] then
//! pulls out the handful of fields the state machine consumes. All lenient
//! casting lives here; a field of the wrong shape becomes `None`.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::AuthError;

/// Stripe event types we reconcile
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StripeEventType {
    /// Checkout finished; links the provider customer to our user
    CheckoutSessionCompleted,
    /// Subscription created
    SubscriptionCreated,
    /// Subscription changed (plan, status, renewal)
    SubscriptionUpdated,
    /// Subscription ended
    SubscriptionDeleted,
    /// Renewal charge failed
    InvoicePaymentFailed,
    /// Renewal charge succeeded
    InvoicePaymentSucceeded,
    /// Anything else, carrying the original type string
    Unknown(String),
}

impl FromStr for StripeEventType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl StripeEventType {
    /// Parse an event type string; never fails
    pub fn parse(s: &str) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::Unknown(original) => original,
        }
    }

    /// Check if this is a known event type
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    fn is_subscription_event(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionCreated | Self::SubscriptionUpdated | Self::SubscriptionDeleted
        )
    }
}

impl fmt::Display for StripeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated event envelope with an untyped view of the event object
///
/// Only `type` is required. Envelope fields of the wrong shape fall back to
/// their defaults, the same way [`decode`] treats object fields.
#[derive(Debug, Clone, Default)]
pub struct VerifiedEvent {
    /// Unique identifier for the event (`evt_...`); empty if absent
    pub id: String,

    /// Type of event, as sent
    pub event_type: String,

    /// Time of event creation (Unix timestamp); 0 if absent
    pub created: i64,

    /// Whether this is a live mode event
    pub livemode: bool,

    /// Event data container
    pub data: EventData,

    raw_payload: Vec<u8>,
}

/// Event data container
#[derive(Debug, Clone, Default)]
pub struct EventData {
    /// The event object (checkout session, subscription, invoice, ...)
    pub object: Value,
}

impl VerifiedEvent {
    /// Parse the envelope from raw JSON bytes, keeping the bytes alongside
    ///
    /// Fails only when the body is not a JSON object or has no string `type`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| AuthError::InvalidPayload(e.to_string()))?;
        let Value::Object(mut envelope) = value else {
            return Err(AuthError::InvalidPayload(
                "event is not a JSON object".to_string(),
            ));
        };

        let event_type = match envelope.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => {
                return Err(AuthError::InvalidPayload(
                    "missing string field `type`".to_string(),
                ))
            }
        };

        let object = match envelope.remove("data") {
            Some(Value::Object(mut data)) => data.remove("object").unwrap_or_default(),
            _ => Value::Null,
        };

        Ok(Self {
            id: envelope
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            event_type,
            created: envelope
                .get("created")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            livemode: envelope
                .get("livemode")
                .and_then(Value::as_bool)
                .unwrap_or_default(),
            data: EventData { object },
            raw_payload: bytes.to_vec(),
        })
    }

    /// Get the typed event type
    pub fn typed_event_type(&self) -> StripeEventType {
        StripeEventType::parse(&self.event_type)
    }

    /// The event object as a key-value map, if it is one
    pub fn object(&self) -> Option<&Map<String, Value>> {
        self.data.object.as_object()
    }

    /// The exact bytes the signature was computed over
    pub fn raw_payload(&self) -> &[u8] {
        &self.raw_payload
    }
}

/// Minimal typed record the state machine works from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    /// Provider event id, for logging
    pub event_id: String,
    /// Dispatch key
    pub kind: StripeEventType,
    /// Provider customer id (`cus_...`)
    pub customer_id: Option<String>,
    /// Provider subscription id (`sub_...`); only read from subscription events
    pub subscription_id: Option<String>,
    /// Internal user id round-tripped through checkout
    pub client_reference_id: Option<String>,
    /// The verified request body
    pub raw_payload: Vec<u8>,
}

/// Decode a verified event into the fields reconciliation consumes. Never fails.
///
/// On subscription events the object's own `id` is the subscription id. On
/// every other type `id` names a different object (`cs_...`, `in_...`) and is
/// not read.
pub fn decode(event: VerifiedEvent) -> DecodedEvent {
    let kind = event.typed_event_type();
    let object = event.object();

    let customer_id = object.and_then(|o| string_or_expanded_id(o.get("customer")));
    let client_reference_id = object.and_then(|o| string_field(o.get("client_reference_id")));
    let subscription_id = if kind.is_subscription_event() {
        object.and_then(|o| string_field(o.get("id")))
    } else {
        None
    };

    debug!(
        event_id = %event.id,
        event_type = %kind,
        known = kind.is_known(),
        has_customer = customer_id.is_some(),
        has_subscription = subscription_id.is_some(),
        has_client_reference = client_reference_id.is_some(),
        "Decoded webhook event"
    );

    DecodedEvent {
        event_id: event.id,
        kind,
        customer_id,
        subscription_id,
        client_reference_id,
        raw_payload: event.raw_payload,
    }
}

/// Non-empty string, or nothing
fn string_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Accept both `"customer": "cus_1"` and an expanded `"customer": {"id": "cus_1", ...}`
fn string_or_expanded_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Object(expanded) => string_field(expanded.get("id")),
        other => string_field(Some(other)),
    }
}
