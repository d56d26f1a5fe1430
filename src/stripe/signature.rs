//! Webhook Signature Verification
//!
//! Stripe signs every delivery with HMAC-SHA256 over `"{timestamp}.{raw_body}"`
//! and sends the result in the `Stripe-Signature` header:
//!
//! ```text
//! Stripe-Signature: t=1614556800,v1=5257a869e7ec...,v1=9a3f...,v0=...
//! ```
//!
//! Several `v1` entries may be present while a secret is being rolled; any
//! one matching is enough. The body must be the exact bytes received. Parsing
//! and re-serializing JSON changes whitespace and key order and breaks the MAC.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::AuthError;
use crate::stripe::events::VerifiedEvent;

type HmacSha256 = Hmac<Sha256>;

/// Name of the header carrying the signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Parsed `Stripe-Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Signed unix timestamp (`t=`)
    pub timestamp: i64,
    /// Hex-encoded `v1` signatures
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse the comma-separated `key=value` list. Unknown keys (`v0`) are ignored.
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => {
                    let ts = value.parse::<i64>().map_err(|_| {
                        AuthError::MalformedHeader(format!("bad timestamp {:?}", value))
                    })?;
                    timestamp = Some(ts);
                }
                "v1" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| AuthError::MalformedHeader("no timestamp".to_string()))?;
        if signatures.is_empty() {
            return Err(AuthError::MalformedHeader("no v1 signature".to_string()));
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Compute the hex `v1` signature for `payload` signed at `timestamp`
pub fn compute_signature(secret: &[u8], timestamp: i64, payload: &[u8]) -> String {
    hex::encode(mac_bytes(secret, timestamp, payload))
}

fn mac_bytes(secret: &[u8], timestamp: i64, payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Verifies inbound webhook deliveries against the shared signing secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[redacted]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl SignatureVerifier {
    /// Create a verifier for `secret` accepting timestamps within `tolerance` of now
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into().into_bytes(),
            tolerance,
        }
    }

    /// Verify `raw_body` against `header` using the current clock
    pub fn verify(&self, raw_body: &[u8], header: &str) -> Result<VerifiedEvent, AuthError> {
        self.verify_at(raw_body, header, chrono::Utc::now().timestamp())
    }

    /// Verify `raw_body` against `header` as of unix time `now`
    ///
    /// Signature is checked before freshness, so a forged request always
    /// reports `InvalidSignature` regardless of its timestamp.
    pub fn verify_at(
        &self,
        raw_body: &[u8],
        header: &str,
        now: i64,
    ) -> Result<VerifiedEvent, AuthError> {
        let parsed = SignatureHeader::parse(header)?;
        let expected = mac_bytes(&self.secret, parsed.timestamp, raw_body);

        let matched = parsed.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| bytes.len() == expected.len() && bool::from(bytes.ct_eq(&expected)))
                .unwrap_or(false)
        });
        if !matched {
            return Err(AuthError::InvalidSignature);
        }

        let age_secs = now.saturating_sub(parsed.timestamp);
        if age_secs.unsigned_abs() > self.tolerance.as_secs() {
            return Err(AuthError::StaleTimestamp { age_secs });
        }

        let event = VerifiedEvent::from_bytes(raw_body)?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Webhook signature verified");
        Ok(event)
    }

    /// Build a `Stripe-Signature` header value for `payload` at `timestamp`
    ///
    /// Used by tests and local tooling that replay events against the endpoint.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        format!(
            "t={},v1={}",
            timestamp,
            compute_signature(&self.secret, timestamp, payload)
        )
    }
}
