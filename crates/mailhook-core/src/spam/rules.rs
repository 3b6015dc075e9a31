//! Rule-based spam scoring
//!
//! Regex and header-presence rules evaluated against a decoded view of the
//! transaction: subject, sender, header block and text leaves.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::headers::unfold;
use crate::mime::leaves;
use crate::transaction::Transaction;

/// A spam detection rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamRule {
    /// Rule name/identifier
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    /// Regex, header name or length depending on the rule type
    pub pattern: String,
    /// Score to add when rule matches (positive = spam, negative = ham)
    pub score: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Type of spam rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Match pattern in the header block
    Header,
    /// Match pattern in decoded text parts
    Body,
    /// Match the From header address
    From,
    /// Match the decoded subject
    Subject,
    /// Header must be present
    HasHeader,
    /// Header must be absent
    MissingHeader,
    /// Text body no longer than the pattern's byte count
    BodyLength,
    /// Match pattern anywhere in headers or text
    Url,
}

/// Result of rule-based spam check
#[derive(Debug, Clone, Default)]
pub struct RuleResult {
    /// Aggregate spam score
    pub score: f64,
    /// Names of matched rules
    pub matched_rules: Vec<String>,
    pub matches: Vec<RuleMatch>,
}

/// A single rule match
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_name: String,
    pub score: f64,
    pub description: String,
}

/// Decoded fields rules are evaluated against
#[derive(Debug, Clone, Default)]
pub struct MessageView {
    pub subject: String,
    pub from: String,
    pub header_block: String,
    pub header_names: Vec<String>,
    pub text: String,
}

impl MessageView {
    /// Build a view of the transaction's headers and text leaves.
    ///
    /// Encoded words in Subject and From are decoded with `mail-parser`.
    /// Text leaves that fail to decode are skipped.
    pub fn from_transaction(txn: &Transaction) -> Self {
        let mut block = Vec::new();
        txn.headers.write_to(&mut block);
        block.extend_from_slice(b"\r\n");

        let parsed = mail_parser::MessageParser::default().parse(&block[..]);
        let subject = parsed
            .as_ref()
            .and_then(|m| m.subject().map(|s| s.to_string()))
            .unwrap_or_else(|| unfold(txn.headers.get("Subject")));
        let from = parsed
            .as_ref()
            .and_then(|m| m.from())
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_else(|| unfold(txn.headers.get("From")));

        let mut text = String::new();
        for part in leaves(&txn.body).filter(|p| p.content_type.starts_with("text/")) {
            match part.text() {
                Ok(decoded) => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&decoded);
                }
                Err(e) => debug!("Skipping undecodable {} part: {}", part.content_type, e),
            }
        }

        Self {
            subject,
            from,
            header_block: String::from_utf8_lossy(&block).into_owned(),
            header_names: txn
                .headers
                .iter()
                .map(|(name, _)| name.to_ascii_lowercase())
                .collect(),
            text,
        }
    }
}

/// Rule-based spam filter
pub struct RuleBasedFilter {
    rules: Vec<SpamRule>,
    compiled_patterns: HashMap<String, Regex>,
}

impl RuleBasedFilter {
    /// Create a new rule-based filter with default rules
    pub fn new() -> Self {
        let mut filter = Self::empty();
        filter.add_default_rules();
        filter
    }

    /// Filter with no rules
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            compiled_patterns: HashMap::new(),
        }
    }

    fn add_default_rules(&mut self) {
        let rule = |name: &str, description: &str, rule_type: RuleType, pattern: &str, score: f64| SpamRule {
            name: name.to_string(),
            description: description.to_string(),
            rule_type,
            pattern: pattern.to_string(),
            score,
            enabled: true,
        };

        let default_rules = vec![
            rule(
                "SUBJECT_ALL_CAPS",
                "Subject line is all uppercase",
                RuleType::Subject,
                r"^[A-Z\s\d!?.,:']{6,}$",
                2.0,
            ),
            rule(
                "SUBJECT_URGENCY",
                "Subject contains urgency words",
                RuleType::Subject,
                r"(?i)(urgent|immediate|action required|act now|limited time|expire)",
                1.5,
            ),
            rule(
                "SUBJECT_MONEY",
                "Subject mentions money or prizes",
                RuleType::Subject,
                r"(?i)\b(win|winner|prize|lottery|million|cash|bitcoin)\b",
                2.0,
            ),
            rule(
                "BODY_CLICK_HERE",
                "Body contains 'click here' links",
                RuleType::Body,
                r"(?i)(click here|click below|click this link)",
                1.0,
            ),
            rule(
                "BODY_ADVANCE_FEE",
                "Body matches advance-fee scam wording",
                RuleType::Body,
                r"(?i)(inheritance|beneficiary|next of kin|dying wish)",
                4.0,
            ),
            rule(
                "BODY_PHISHING",
                "Body asks to verify credentials",
                RuleType::Body,
                r"(?i)(verify your account|confirm your identity|update your (password|details))",
                3.0,
            ),
            rule(
                "URL_SHORTENER",
                "Contains URL shortener links",
                RuleType::Url,
                r"(?i)\b(bit\.ly|tinyurl\.com|goo\.gl|ow\.ly|is\.gd)/",
                1.5,
            ),
            rule(
                "URL_IP_ADDRESS",
                "Contains URL with a literal IP address",
                RuleType::Url,
                r"https?://\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}",
                3.0,
            ),
            rule("MISSING_DATE", "Missing Date header", RuleType::MissingHeader, "Date", 1.5),
            rule(
                "MISSING_MESSAGE_ID",
                "Missing Message-ID header",
                RuleType::MissingHeader,
                "Message-ID",
                1.0,
            ),
            rule(
                "FROM_SUSPICIOUS_TLD",
                "From address in a frequently abused top-level domain",
                RuleType::From,
                r"(?i)\.(xyz|top|gq|ml|cf|tk|click|loan)$",
                2.0,
            ),
            rule("BODY_EMPTY", "Message has no text", RuleType::BodyLength, "0", 2.0),
        ];

        for rule in default_rules {
            self.add_rule(rule);
        }
    }

    /// Add a custom rule. Rules with an invalid regex are kept but never match.
    pub fn add_rule(&mut self, rule: SpamRule) {
        if matches!(
            rule.rule_type,
            RuleType::Header | RuleType::Body | RuleType::From | RuleType::Subject | RuleType::Url
        ) {
            match Regex::new(&rule.pattern) {
                Ok(regex) => {
                    self.compiled_patterns.insert(rule.name.clone(), regex);
                }
                Err(e) => warn!("Spam rule {} has an invalid pattern: {}", rule.name, e),
            }
        }
        self.rules.push(rule);
    }

    /// Score a message view against every enabled rule
    pub fn check(&self, view: &MessageView) -> RuleResult {
        let mut result = RuleResult::default();

        for rule in self.rules.iter().filter(|r| r.enabled) {
            let regex_match = |haystack: &str| {
                self.compiled_patterns
                    .get(&rule.name)
                    .map(|re| re.is_match(haystack))
                    .unwrap_or(false)
            };

            let matched = match rule.rule_type {
                RuleType::Subject => regex_match(&view.subject),
                RuleType::Body => regex_match(&view.text),
                RuleType::From => regex_match(&view.from),
                RuleType::Header => regex_match(&view.header_block),
                RuleType::Url => regex_match(&view.header_block) || regex_match(&view.text),
                RuleType::HasHeader => view.header_names.contains(&rule.pattern.to_ascii_lowercase()),
                RuleType::MissingHeader => !view.header_names.contains(&rule.pattern.to_ascii_lowercase()),
                RuleType::BodyLength => rule
                    .pattern
                    .parse::<usize>()
                    .map(|max_len| view.text.trim().len() <= max_len)
                    .unwrap_or(false),
            };

            if matched {
                debug!("Rule {} matched, adding score {}", rule.name, rule.score);
                result.score += rule.score;
                result.matched_rules.push(rule.name.clone());
                result.matches.push(RuleMatch {
                    rule_name: rule.name.clone(),
                    score: rule.score,
                    description: rule.description.clone(),
                });
            }
        }

        result
    }

    /// Get all rules
    pub fn get_rules(&self) -> &[SpamRule] {
        &self.rules
    }

    /// Enable/disable a rule by name
    pub fn set_rule_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.name == name) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

impl Default for RuleBasedFilter {
    fn default() -> Self {
        Self::new()
    }
}
