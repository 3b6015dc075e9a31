//! Received trace header

use async_trait::async_trait;
use chrono::Utc;
use mailhook_common::types::{HookName, HookOutcome};
use tracing::debug;

use super::types::{LoadContext, Plugin, PluginResult};
use crate::transaction::Transaction;

/// Prepends a `Received:` header describing this hop
#[derive(Debug)]
pub struct ReceivedPlugin {
    hostname: String,
}

impl ReceivedPlugin {
    pub const NAME: &'static str = "received";

    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    fn trace_value(&self, txn: &Transaction) -> String {
        let helo = txn.helo.as_deref().unwrap_or("unknown");
        let mut value = match txn.client_ip {
            Some(ip) => format!("from {} ([{}])", helo, ip),
            None => format!("from {}", helo),
        };
        value.push_str(&format!(
            "\r\n\tby {} with ESMTP id {}",
            self.hostname,
            txn.id().simple()
        ));
        if let [rcpt] = txn.recipients() {
            value.push_str(&format!("\r\n\tfor <{}>", rcpt));
        }
        value.push_str(&format!("; {}", Utc::now().to_rfc2822()));
        value
    }
}

impl Default for ReceivedPlugin {
    fn default() -> Self {
        Self::new("localhost")
    }
}

#[async_trait]
impl Plugin for ReceivedPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &[HookName] {
        &[HookName::BodyComplete]
    }

    async fn on_load(&mut self, ctx: &LoadContext) -> PluginResult<()> {
        self.hostname = ctx.hostname().to_string();
        Ok(())
    }

    async fn on_body_complete(&self, txn: &mut Transaction) -> PluginResult<HookOutcome> {
        let value = self.trace_value(txn);
        debug!("Prepending Received header");
        txn.headers.prepend("Received", value);
        Ok(HookOutcome::Continue)
    }
}
