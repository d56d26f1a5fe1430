//! Subscription State Machine
//!
//! Pure decision logic: a decoded event either maps to exactly one
//! persistence call or to nothing. Transitions are keyed on the event type,
//! not on the current status, so replaying an event produces the same write.
//!
//! | Event | Requires | Effect |
//! |---|---|---|
//! | `checkout.session.completed` | customer, client_reference_id | link customer to user |
//! | `customer.subscription.created` / `.updated` | customer, subscription | `active` |
//! | `customer.subscription.deleted` | customer | `cancelled` |
//! | `invoice.payment_failed` | customer | `past_due` + `payment_failed` email |
//! | `invoice.payment_succeeded` | customer | `active` |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::mailer::Template;
use crate::stripe::events::{DecodedEvent, StripeEventType};

/// Subscription status stored on the user record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Never subscribed
    #[default]
    None,
    /// Paid up
    Active,
    /// Latest renewal charge failed
    PastDue,
    /// Subscription ended
    Cancelled,
}

impl SubscriptionStatus {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status grants access to gated content
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

/// A single persistence decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransition {
    /// Record which provider customer belongs to which user. No status change.
    LinkCustomer {
        /// Internal user id from `client_reference_id`
        user_id: Uuid,
        /// Provider customer id
        customer_id: String,
    },

    /// Overwrite the status of the user owning `customer_id`
    SetStatus {
        /// Provider customer id; the lookup key
        customer_id: String,
        /// New subscription id, or `None` to keep the stored one
        subscription_id: Option<String>,
        /// Target status
        status: SubscriptionStatus,
        /// Email to send to the resolved user once the write commits
        notify: Option<Template>,
    },
}

impl StateTransition {
    /// Provider customer id this transition is keyed on
    pub fn customer_id(&self) -> &str {
        match self {
            Self::LinkCustomer { customer_id, .. } | Self::SetStatus { customer_id, .. } => {
                customer_id
            }
        }
    }

    /// Target status, if this transition changes one
    pub fn target_status(&self) -> Option<SubscriptionStatus> {
        match self {
            Self::LinkCustomer { .. } => None,
            Self::SetStatus { status, .. } => Some(*status),
        }
    }

    /// Notification to send after commit
    pub fn notify(&self) -> Option<Template> {
        match self {
            Self::LinkCustomer { .. } => None,
            Self::SetStatus { notify, .. } => *notify,
        }
    }
}

/// Decide what, if anything, `event` should change.
///
/// `None` means the event is ignored: an unknown type, or a known type
/// missing a field it needs. Either way the delivery is still acknowledged.
pub fn decide(event: &DecodedEvent) -> Option<StateTransition> {
    match &event.kind {
        StripeEventType::CheckoutSessionCompleted => {
            let customer_id = require(event, event.customer_id.as_ref(), "customer")?;
            let reference = require(event, event.client_reference_id.as_ref(), "client_reference_id")?;
            let user_id = match Uuid::parse_str(reference) {
                Ok(id) => id,
                Err(e) => {
                    warn!(
                        event_id = %event.event_id,
                        event_type = %event.kind,
                        client_reference_id = %reference,
                        error = %e,
                        "Dropping transition: client_reference_id is not a user id"
                    );
                    return None;
                }
            };
            Some(StateTransition::LinkCustomer {
                user_id,
                customer_id: customer_id.clone(),
            })
        }

        StripeEventType::SubscriptionCreated | StripeEventType::SubscriptionUpdated => {
            let customer_id = require(event, event.customer_id.as_ref(), "customer")?;
            let subscription_id = require(event, event.subscription_id.as_ref(), "id")?;
            Some(set_status(
                customer_id,
                Some(subscription_id.clone()),
                SubscriptionStatus::Active,
                None,
            ))
        }

        StripeEventType::SubscriptionDeleted => {
            let customer_id = require(event, event.customer_id.as_ref(), "customer")?;
            Some(set_status(
                customer_id,
                event.subscription_id.clone(),
                SubscriptionStatus::Cancelled,
                None,
            ))
        }

        StripeEventType::InvoicePaymentFailed => {
            let customer_id = require(event, event.customer_id.as_ref(), "customer")?;
            Some(set_status(
                customer_id,
                None,
                SubscriptionStatus::PastDue,
                Some(Template::PaymentFailed),
            ))
        }

        StripeEventType::InvoicePaymentSucceeded => {
            let customer_id = require(event, event.customer_id.as_ref(), "customer")?;
            Some(set_status(customer_id, None, SubscriptionStatus::Active, None))
        }

        StripeEventType::Unknown(event_type) => {
            info!(event_id = %event.event_id, event_type = %event_type, "Unhandled stripe event");
            None
        }
    }
}

fn set_status(
    customer_id: &str,
    subscription_id: Option<String>,
    status: SubscriptionStatus,
    notify: Option<Template>,
) -> StateTransition {
    StateTransition::SetStatus {
        customer_id: customer_id.to_string(),
        subscription_id,
        status,
        notify,
    }
}

fn require<'a>(event: &DecodedEvent, field: Option<&'a String>, name: &str) -> Option<&'a String> {
    if field.is_none() {
        warn!(
            event_id = %event.event_id,
            event_type = %event.kind,
            missing = name,
            "Dropping transition: required field absent"
        );
    }
    field
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const USER: &str = "0b6f1c1e-4c84-4a43-9d71-7a3c1f0e2b9d";

    fn event(
        kind: &str,
        customer: Option<&str>,
        subscription: Option<&str>,
        reference: Option<&str>,
    ) -> DecodedEvent {
        DecodedEvent {
            event_id: "evt_test".to_string(),
            kind: StripeEventType::parse(kind),
            customer_id: customer.map(String::from),
            subscription_id: subscription.map(String::from),
            client_reference_id: reference.map(String::from),
            raw_payload: Vec::new(),
        }
    }

    #[test]
    fn test_checkout_links_customer() {
        let t = decide(&event(
            "checkout.session.completed",
            Some("cus_1"),
            None,
            Some(USER),
        ))
        .unwrap();
        assert_eq!(
            t,
            StateTransition::LinkCustomer {
                user_id: Uuid::parse_str(USER).unwrap(),
                customer_id: "cus_1".to_string(),
            }
        );
        assert_eq!(t.target_status(), None);
        assert_eq!(t.notify(), None);
    }

    #[test]
    fn test_checkout_requires_both_fields() {
        assert!(decide(&event("checkout.session.completed", None, None, Some(USER))).is_none());
        assert!(decide(&event("checkout.session.completed", Some("cus_1"), None, None)).is_none());
        assert!(decide(&event(
            "checkout.session.completed",
            Some("cus_1"),
            None,
            Some("user-42")
        ))
        .is_none());
    }

    #[test]
    fn test_subscription_created_and_updated_activate() {
        for kind in ["customer.subscription.created", "customer.subscription.updated"] {
            let t = decide(&event(kind, Some("cus_1"), Some("sub_1"), None)).unwrap();
            assert_eq!(
                t,
                StateTransition::SetStatus {
                    customer_id: "cus_1".to_string(),
                    subscription_id: Some("sub_1".to_string()),
                    status: SubscriptionStatus::Active,
                    notify: None,
                }
            );
        }
    }

    #[test]
    fn test_subscription_active_requires_subscription_id() {
        assert!(decide(&event("customer.subscription.created", Some("cus_1"), None, None)).is_none());
        assert!(decide(&event("customer.subscription.updated", None, Some("sub_1"), None)).is_none());
    }

    #[test]
    fn test_subscription_deleted_cancels() {
        let t = decide(&event("customer.subscription.deleted", Some("cus_1"), None, None)).unwrap();
        assert_eq!(t.target_status(), Some(SubscriptionStatus::Cancelled));
        assert_eq!(t.customer_id(), "cus_1");
        assert!(decide(&event("customer.subscription.deleted", None, Some("sub_1"), None)).is_none());
    }

    #[test]
    fn test_payment_failed_notifies() {
        let t = decide(&event("invoice.payment_failed", Some("cus_1"), None, None)).unwrap();
        assert_eq!(
            t,
            StateTransition::SetStatus {
                customer_id: "cus_1".to_string(),
                subscription_id: None,
                status: SubscriptionStatus::PastDue,
                notify: Some(Template::PaymentFailed),
            }
        );
    }

    #[test]
    fn test_payment_succeeded_reactivates_quietly() {
        let t = decide(&event("invoice.payment_succeeded", Some("cus_1"), None, None)).unwrap();
        assert_eq!(t.target_status(), Some(SubscriptionStatus::Active));
        assert_eq!(t.notify(), None);
        assert!(decide(&event("invoice.payment_succeeded", None, None, None)).is_none());
    }

    #[test]
    fn test_unknown_event_ignored() {
        assert!(decide(&event("something.new", Some("cus_1"), Some("sub_1"), Some(USER))).is_none());
    }

    #[test]
    fn test_decision_is_deterministic() {
        let e = event("customer.subscription.deleted", Some("cus_1"), Some("sub_1"), None);
        assert_eq!(decide(&e), decide(&e));
    }

    #[test]
    fn test_status_strings() {
        for status in [
            SubscriptionStatus::None,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
        assert!(SubscriptionStatus::Active.is_active());
        assert!(!SubscriptionStatus::PastDue.is_active());
        assert_eq!(
            serde_json::to_string(&SubscriptionStatus::PastDue).unwrap(),
            "\"past_due\""
        );
    }
}
