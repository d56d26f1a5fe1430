//! Error types for the Level Up billing backend
//!
//! One `thiserror` enum per concern, wrapped by the crate-level [`Error`].
//! Almost none of these reach a client: the webhook path turns everything
//! except [`AuthError`] into a log line and a 200.

use thiserror::Error;

/// The main error type for billing operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Webhook authenticity errors
    #[error("Webhook authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Persistence gateway errors
    #[error("Persistence error: {0}")]
    Gateway(#[from] GatewayError),

    /// Mail delivery errors
    #[error("Mail delivery error: {0}")]
    Send(#[from] SendError),

    /// Notification queue errors
    #[error("Mail queue error: {0}")]
    Enqueue(#[from] EnqueueError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Environment configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required variable is unset or empty
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    /// Variable is set but cannot be parsed
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Raw value that failed to parse
        value: String,
    },
}

/// Webhook authenticity failures. Terminal for the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No signature header on the request
    #[error("missing Stripe-Signature header")]
    MissingHeader,

    /// Header present but lacks a timestamp or v1 signature
    #[error("malformed signature header: {0}")]
    MalformedHeader(String),

    /// No v1 signature matched the expected HMAC
    #[error("invalid signature")]
    InvalidSignature,

    /// Signed timestamp is outside the tolerance window
    #[error("signature timestamp outside tolerance ({age_secs}s old)")]
    StaleTimestamp {
        /// Signed timestamp age in seconds (negative when from the future)
        age_secs: i64,
    },

    /// Signature verified but the body is not an event envelope
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

impl AuthError {
    /// HTTP status code the webhook endpoint answers with
    pub fn status_code(&self) -> u16 {
        400
    }
}

/// Persistence gateway failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Backing store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Write rejected by a store constraint
    #[error("write conflict: {0}")]
    Conflict(String),
}

impl GatewayError {
    /// Whether retrying the same write could succeed later
    ///
    /// `Conflict` is decided by data already in the store, so a redelivery
    /// hits it again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Mail collaborator failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Connection or protocol failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Mail API answered with a non-success status
    #[error("mail API rejected message ({status}): {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },
}

/// Notification queue failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity; the job was dropped
    #[error("mail queue is full")]
    QueueFull,

    /// Dispatcher already closed; enqueueing now is a caller bug
    #[error("mail queue is closed")]
    Closed,
}

/// Result type alias for billing operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a generic error from a string
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }
}
