//! Outbound email
//!
//! - [`Mailer`]: bounded, non-blocking queue drained by a fixed worker pool
//! - [`Template`]: closed set of email bodies with a fallback
//! - [`MailTransport`]: the delivery collaborator (log, HTTP API, in-memory)

pub mod dispatcher;
pub mod templates;
pub mod transport;

pub use dispatcher::{EmailJob, Mailer, MailerStats, MailerStatsSnapshot};
pub use templates::{render, Template};
pub use transport::{LogTransport, MailTransport, MemoryTransport, OutgoingMessage, ResendTransport};
