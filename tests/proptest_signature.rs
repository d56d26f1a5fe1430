//! Property-based tests for webhook authentication and decoding.
//!
//! Uses proptest to generate arbitrary bodies, headers and event objects and
//! check the invariants the webhook route relies on.

use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use levelup_billing::error::AuthError;
use levelup_billing::stripe::{
    decide, decode, SignatureHeader, SignatureVerifier, StripeEventType, VerifiedEvent,
};

const NOW: i64 = 1_700_000_000;

fn verifier() -> SignatureVerifier {
    SignatureVerifier::new("whsec_prop", Duration::from_secs(300))
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// Event types the pipeline understands, plus arbitrary others
fn arb_event_type() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("checkout.session.completed".to_string()),
        Just("customer.subscription.created".to_string()),
        Just("customer.subscription.updated".to_string()),
        Just("customer.subscription.deleted".to_string()),
        Just("invoice.payment_failed".to_string()),
        Just("invoice.payment_succeeded".to_string()),
        "[a-z_]{1,12}\\.[a-z_]{1,12}",
    ]
}

/// Scalar JSON values, including the wrong shapes for id fields
fn arb_field() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![
        Just(None),
        Just(Some(Value::Null)),
        Just(Some(json!(""))),
        any::<i64>().prop_map(|n| Some(json!(n))),
        "[a-z]{3}_[A-Za-z0-9]{1,14}".prop_map(|s| Some(json!(s))),
        "[a-z]{3}_[A-Za-z0-9]{1,14}".prop_map(|s| Some(json!({ "id": s }))),
    ]
}

fn arb_envelope() -> impl Strategy<Value = Vec<u8>> {
    (arb_event_type(), arb_field(), arb_field(), arb_field()).prop_map(
        |(kind, id, customer, reference)| {
            let mut object = serde_json::Map::new();
            for (key, value) in [
                ("id", id),
                ("customer", customer),
                ("client_reference_id", reference),
            ] {
                if let Some(value) = value {
                    object.insert(key.to_string(), value);
                }
            }
            json!({ "id": "evt_prop", "type": kind, "data": { "object": object } })
                .to_string()
                .into_bytes()
        },
    )
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Changing any byte of a signed body invalidates it
    #[test]
    fn prop_tampered_body_never_verifies(
        body in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let verifier = verifier();
        let header = verifier.sign(&body, NOW);

        let mut tampered = body.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= mask;

        prop_assert_eq!(
            verifier.verify_at(&tampered, &header, NOW).err(),
            Some(AuthError::InvalidSignature)
        );
    }

    /// A correct signature outside the window is stale, inside it is accepted
    #[test]
    fn prop_freshness_window_is_symmetric(body in arb_envelope(), skew in -1_000i64..1_000) {
        let verifier = verifier();
        let header = verifier.sign(&body, NOW + skew);
        let result = verifier.verify_at(&body, &header, NOW);

        if skew.abs() > 300 {
            prop_assert_eq!(result.err(), Some(AuthError::StaleTimestamp { age_secs: -skew }));
        } else {
            prop_assert!(result.is_ok());
        }
    }

    /// Header parsing never panics
    #[test]
    fn prop_header_parse_total(header in "\\PC{0,200}") {
        let _ = SignatureHeader::parse(&header);
    }

    /// Decoding and deciding never panic, and unknown types never transition
    #[test]
    fn prop_decode_and_decide_total(body in arb_envelope()) {
        let event = VerifiedEvent::from_bytes(&body).unwrap();
        let decoded = decode(event);

        let first = decide(&decoded);
        prop_assert_eq!(&first, &decide(&decoded));
        if matches!(decoded.kind, StripeEventType::Unknown(_)) {
            prop_assert!(first.is_none());
        }
        if let Some(transition) = first {
            prop_assert_eq!(Some(transition.customer_id()), decoded.customer_id.as_deref());
        }
    }
}
