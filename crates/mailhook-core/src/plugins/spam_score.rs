//! Spam scoring at end of DATA

use async_trait::async_trait;
use mailhook_common::types::{HookName, HookOutcome};
use serde::Deserialize;
use tracing::{debug, info};

use super::types::{LoadContext, Plugin, PluginResult};
use crate::spam::{RuleBasedFilter, SpamFilter, SpamRule};
use crate::transaction::Transaction;

/// Note holding the computed score
pub const SPAM_SCORE_NOTE: &str = "spam.score";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Settings {
    /// Score at which a message is marked as spam
    threshold: f64,
    /// Score at which a message is rejected, `None` never rejects
    reject_threshold: Option<f64>,
    /// Points for a client with reputation score 100
    dnsbl_weight: f64,
    /// Start from an empty rule set instead of the built-in rules
    replace_default_rules: bool,
    rules: Vec<SpamRule>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold: 5.0,
            reject_threshold: Some(10.0),
            dnsbl_weight: 5.0,
            replace_default_rules: false,
            rules: Vec::new(),
        }
    }
}

/// Scores the message and records the verdict in `X-Spam-*` headers
pub struct SpamScorePlugin {
    filter: SpamFilter,
}

impl SpamScorePlugin {
    pub const NAME: &'static str = "spam_score";

    pub fn new(filter: SpamFilter) -> Self {
        Self { filter }
    }
}

impl Default for SpamScorePlugin {
    fn default() -> Self {
        Self::new(SpamFilter::default())
    }
}

#[async_trait]
impl Plugin for SpamScorePlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &[HookName] {
        &[HookName::BodyComplete]
    }

    async fn on_load(&mut self, ctx: &LoadContext) -> PluginResult<()> {
        let settings: Settings = ctx.settings()?;
        let rules = if settings.replace_default_rules {
            RuleBasedFilter::empty()
        } else {
            RuleBasedFilter::new()
        };

        let mut filter = SpamFilter::new(rules, settings.threshold, settings.reject_threshold)
            .with_dnsbl_weight(settings.dnsbl_weight);
        for rule in settings.rules {
            filter.add_rule(rule);
        }
        self.filter = filter;
        Ok(())
    }

    async fn on_body_complete(&self, txn: &mut Transaction) -> PluginResult<HookOutcome> {
        let result = self.filter.check(txn);
        debug!(score = result.score, symbols = ?result.symbols, "Spam check finished");

        txn.headers.replace("X-Spam-Score", format!("{:.1}", result.score));
        txn.headers.replace("X-Spam-Status", result.status_header());
        txn.set_note(SPAM_SCORE_NOTE, result.score);

        if result.is_reject {
            info!(score = result.score, "Rejecting message as spam");
            return Ok(HookOutcome::deny(550, "5.7.1 Message rejected as spam"));
        }
        Ok(HookOutcome::Continue)
    }
}
