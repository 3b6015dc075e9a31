//! Common types for Mailhook

use serde::{Deserialize, Serialize};

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    ///
    /// Angle brackets around the address are accepted. The split happens on
    /// the last `@`, so quoted local parts containing `@` survive.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(s);

        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
            return None;
        }
        Some(Self::new(local, domain))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| crate::Error::Validation(format!("Invalid email address: {}", s)))
    }
}

/// Lifecycle points at which plugin handlers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    /// MAIL FROM accepted by the engine
    EnvelopeFrom,
    /// One RCPT TO, fired once per recipient
    EnvelopeTo,
    /// Full message body, including every MIME part, is available
    BodyComplete,
}

impl HookName {
    /// All hooks, in pipeline order
    pub const ALL: [HookName; 3] = [
        HookName::EnvelopeFrom,
        HookName::EnvelopeTo,
        HookName::BodyComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::EnvelopeFrom => "envelope_from",
            HookName::EnvelopeTo => "envelope_to",
            HookName::BodyComplete => "body_complete",
        }
    }
}

impl std::fmt::Display for HookName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookName {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "envelope_from" | "mail" => Ok(HookName::EnvelopeFrom),
            "envelope_to" | "rcpt" => Ok(HookName::EnvelopeTo),
            "body_complete" | "data_post" => Ok(HookName::BodyComplete),
            other => Err(crate::Error::Validation(format!("Unknown hook: {}", other))),
        }
    }
}

/// SMTP reply the engine writes on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 250 reply
    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(250, message)
    }

    /// Whether the reply accepts the command (2xx or 3xx)
    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Continuation signal returned by a hook handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOutcome {
    /// Proceed to the next handler
    Continue,
    /// Skip the remaining handlers of this hook
    Done,
    /// Abort the transaction with the given reply
    Deny(Reply),
}

impl HookOutcome {
    /// Deny with an explicit code and message
    pub fn deny(code: u16, message: impl Into<String>) -> Self {
        HookOutcome::Deny(Reply::new(code, message))
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, HookOutcome::Deny(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_email_address_angle_brackets() {
        let email = EmailAddress::parse("<alice@Example.COM>").unwrap();
        assert_eq!(email.local, "alice");
        assert_eq!(email.domain, "Example.COM");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
        assert!("<>".parse::<EmailAddress>().is_err());
    }

    #[test]
    fn test_hook_name_round_trip() {
        for hook in HookName::ALL {
            assert_eq!(hook.as_str().parse::<HookName>().unwrap(), hook);
        }
        assert_eq!("data_post".parse::<HookName>().unwrap(), HookName::BodyComplete);
        assert!("queue".parse::<HookName>().is_err());
    }

    #[test]
    fn test_reply_classes() {
        assert!(Reply::ok("2.0.0 OK").is_positive());
        assert!(Reply::new(354, "go ahead").is_positive());
        let deny = Reply::new(550, "5.7.1 Rejected");
        assert!(!deny.is_positive());
        assert_eq!(deny.to_string(), "550 5.7.1 Rejected");
    }

    #[test]
    fn test_hook_outcome_deny() {
        let outcome = HookOutcome::deny(554, "5.7.1 Policy");
        assert!(outcome.is_deny());
        assert!(!HookOutcome::Continue.is_deny());
    }
}
