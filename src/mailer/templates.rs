//! Email templates
//!
//! A closed set of templates. Names coming from outside (queued jobs, older
//! callers) that match nothing render the fallback body instead of failing.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Product name used in subjects and bodies
pub const PRODUCT_NAME: &str = "Level Up Backend";

/// Known email templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Sent by the registration flow
    Welcome,
    /// Sent when a renewal charge fails
    PaymentFailed,
    /// Generic body for unrecognized names
    Fallback,
}

impl Template {
    /// Resolve a template name; unknown names map to [`Template::Fallback`]
    pub fn from_name(name: &str) -> Self {
        match name {
            "welcome" => Self::Welcome,
            "payment_failed" => Self::PaymentFailed,
            _ => Self::Fallback,
        }
    }

    /// Get the template name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::PaymentFailed => "payment_failed",
            Self::Fallback => "fallback",
        }
    }

    /// Default subject line
    pub fn subject(&self) -> String {
        match self {
            Self::Welcome => format!("Welcome to {}", PRODUCT_NAME),
            Self::PaymentFailed => "Payment failed - update your billing info".to_string(),
            Self::Fallback => PRODUCT_NAME.to_string(),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Render the HTML body for `template`. Values from `data` are HTML-escaped.
pub fn render(template: Template, data: &HashMap<String, String>) -> String {
    let name = data
        .get("name")
        .map(|n| htmlescape::encode_minimal(n))
        .unwrap_or_default();

    match template {
        Template::Welcome => format!(
            "<html><body>\n\
             <h2>Welcome to {product}, {name}!</h2>\n\
             <p>You're on your way from mid-level to senior engineer.</p>\n\
             <p>Start your journey by exploring Module 1: Go Concurrency.</p>\n\
             </body></html>",
            product = PRODUCT_NAME,
            name = name,
        ),
        Template::PaymentFailed => format!(
            "<html><body>\n\
             <h2>Hey {name}, your payment failed</h2>\n\
             <p>Please update your billing info to keep access to {product}.</p>\n\
             </body></html>",
            product = PRODUCT_NAME,
            name = name,
        ),
        Template::Fallback => "<html><body><p>No template found.</p></body></html>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(name: &str) -> HashMap<String, String> {
        HashMap::from([("name".to_string(), name.to_string())])
    }

    #[test]
    fn test_name_resolution() {
        assert_eq!(Template::from_name("welcome"), Template::Welcome);
        assert_eq!(Template::from_name("payment_failed"), Template::PaymentFailed);
        assert_eq!(Template::from_name("invoice_ready"), Template::Fallback);
        assert_eq!(Template::from_name(Template::PaymentFailed.name()), Template::PaymentFailed);
    }

    #[test]
    fn test_payment_failed_body() {
        let body = render(Template::PaymentFailed, &data("Grace"));
        assert!(body.contains("Hey Grace, your payment failed"));
        assert!(body.contains("update your billing info"));
    }

    #[test]
    fn test_welcome_body() {
        let body = render(Template::Welcome, &data("Linus"));
        assert!(body.contains("Welcome to Level Up Backend, Linus!"));
    }

    #[test]
    fn test_fallback_body() {
        let body = render(Template::Fallback, &HashMap::new());
        assert_eq!(body, "<html><body><p>No template found.</p></body></html>");
    }

    #[test]
    fn test_missing_name_renders_empty() {
        let body = render(Template::PaymentFailed, &HashMap::new());
        assert!(body.contains("Hey , your payment failed"));
    }

    #[test]
    fn test_values_are_escaped() {
        let body = render(Template::Welcome, &data("<script>alert(1)</script>"));
        assert!(!body.contains("<script>"));
        assert!(body.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_subjects() {
        assert_eq!(Template::Welcome.subject(), "Welcome to Level Up Backend");
        assert_eq!(
            Template::PaymentFailed.subject(),
            "Payment failed - update your billing info"
        );
    }
}
