//! Spam scoring
//!
//! Combines the rule-based filter with reputation data left in the
//! transaction notes by earlier hooks.

pub mod rules;

pub use rules::{MessageView, RuleBasedFilter, RuleResult, RuleType, SpamRule};

use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

/// Note holding the client reputation score (0-100) set at envelope time
pub const DNSBL_SCORE_NOTE: &str = "dnsbl.score";

/// Overall spam check result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamCheckResult {
    /// Spam score (0.0 = ham, higher = more spam-like)
    pub score: f64,
    /// Threshold score for spam classification
    pub threshold: f64,
    pub is_spam: bool,
    pub is_reject: bool,
    /// Matched rule names
    pub symbols: Vec<String>,
    pub action: SpamAction,
}

impl Default for SpamCheckResult {
    fn default() -> Self {
        Self {
            score: 0.0,
            threshold: 5.0,
            is_spam: false,
            is_reject: false,
            symbols: Vec::new(),
            action: SpamAction::Accept,
        }
    }
}

impl SpamCheckResult {
    /// `X-Spam-Status` value, e.g. `Yes, score=7.5 required=5.0 tests=A,B`
    pub fn status_header(&self) -> String {
        format!(
            "{}, score={:.1} required={:.1} tests={}",
            if self.is_spam { "Yes" } else { "No" },
            self.score,
            self.threshold,
            if self.symbols.is_empty() {
                "none".to_string()
            } else {
                self.symbols.join(",")
            }
        )
    }
}

/// Action to take based on spam check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpamAction {
    #[default]
    Accept,
    /// Add spam headers but accept
    AddHeader,
    Reject,
}

/// Rule-based filter plus reputation weighting
pub struct SpamFilter {
    rules: RuleBasedFilter,
    threshold: f64,
    reject_threshold: Option<f64>,
    dnsbl_weight: f64,
}

impl SpamFilter {
    pub fn new(rules: RuleBasedFilter, threshold: f64, reject_threshold: Option<f64>) -> Self {
        Self {
            rules,
            threshold,
            reject_threshold,
            dnsbl_weight: 5.0,
        }
    }

    /// Points added for a client with a reputation score of 100
    pub fn with_dnsbl_weight(mut self, weight: f64) -> Self {
        self.dnsbl_weight = weight;
        self
    }

    /// Add a custom rule
    pub fn add_rule(&mut self, rule: SpamRule) {
        self.rules.add_rule(rule);
    }

    /// Score the transaction's current headers and body
    pub fn check(&self, txn: &Transaction) -> SpamCheckResult {
        let view = MessageView::from_transaction(txn);
        let rule_result = self.rules.check(&view);

        let mut score = rule_result.score;
        let mut symbols = rule_result.matched_rules;

        // A malformed note counts as no reputation data
        if let Ok(Some(reputation)) = txn.note_as::<f64>(DNSBL_SCORE_NOTE) {
            if reputation > 0.0 {
                score += self.dnsbl_weight * reputation.min(100.0) / 100.0;
                symbols.push("DNSBL_LISTED".to_string());
            }
        }

        let is_spam = score >= self.threshold;
        let is_reject = self.reject_threshold.map(|t| score >= t).unwrap_or(false);

        SpamCheckResult {
            score,
            threshold: self.threshold,
            is_spam,
            is_reject,
            symbols,
            action: if is_reject {
                SpamAction::Reject
            } else if is_spam {
                SpamAction::AddHeader
            } else {
                SpamAction::Accept
            },
        }
    }
}

impl Default for SpamFilter {
    fn default() -> Self {
        Self::new(RuleBasedFilter::new(), 5.0, Some(10.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn txn(raw: &[u8]) -> Transaction {
        let mut txn = Transaction::new(None);
        txn.set_message(raw).unwrap();
        txn
    }

    #[test]
    fn test_spam_check_result_default() {
        let result = SpamCheckResult::default();
        assert!(!result.is_spam);
        assert!(!result.is_reject);
        assert_eq!(result.action, SpamAction::Accept);
        assert_eq!(result.status_header(), "No, score=0.0 required=5.0 tests=none");
    }

    #[test]
    fn test_reputation_note_adds_score() {
        let filter = SpamFilter::new(RuleBasedFilter::empty(), 5.0, None);
        let mut txn = txn(b"Subject: hi\r\n\r\nhello");

        assert_eq!(filter.check(&txn).score, 0.0);

        txn.set_note(DNSBL_SCORE_NOTE, 100.0);
        let result = filter.check(&txn);
        assert_eq!(result.score, 5.0);
        assert!(result.is_spam);
        assert_eq!(result.action, SpamAction::AddHeader);
        assert_eq!(result.symbols, vec!["DNSBL_LISTED".to_string()]);
    }

    #[test]
    fn test_reject_threshold() {
        let mut filter = SpamFilter::new(RuleBasedFilter::empty(), 5.0, Some(8.0));
        filter.add_rule(SpamRule {
            name: "LOTTO".to_string(),
            description: String::new(),
            rule_type: RuleType::Body,
            pattern: "(?i)lottery".to_string(),
            score: 9.0,
            enabled: true,
        });

        let result = filter.check(&txn(b"Subject: hi\r\n\r\nYou won the lottery"));
        assert!(result.is_reject);
        assert_eq!(result.action, SpamAction::Reject);
        assert_eq!(result.status_header(), "Yes, score=9.0 required=5.0 tests=LOTTO");
    }
}
