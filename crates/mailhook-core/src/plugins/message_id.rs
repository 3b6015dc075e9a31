//! Message-ID normalization
//!
//! Guarantees exactly one `Message-ID` header on every accepted message.

use async_trait::async_trait;
use mailhook_common::types::{HookName, HookOutcome};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::types::{LoadContext, Plugin, PluginResult};
use crate::transaction::Transaction;

const HEADER: &str = "Message-ID";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    /// Domain used in generated identifiers, defaults to the server hostname
    domain: Option<String>,
}

/// Adds a Message-ID when missing and collapses duplicates to the first one
#[derive(Debug)]
pub struct MessageIdPlugin {
    domain: String,
}

impl MessageIdPlugin {
    pub const NAME: &'static str = "message_id";

    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    fn generate(&self) -> String {
        format!("<{}@{}>", Uuid::now_v7().simple(), self.domain)
    }
}

impl Default for MessageIdPlugin {
    fn default() -> Self {
        Self::new("localhost")
    }
}

#[async_trait]
impl Plugin for MessageIdPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &[HookName] {
        &[HookName::BodyComplete]
    }

    async fn on_load(&mut self, ctx: &LoadContext) -> PluginResult<()> {
        let settings: Settings = ctx.settings()?;
        self.domain = settings
            .domain
            .unwrap_or_else(|| ctx.hostname().to_string());
        Ok(())
    }

    async fn on_body_complete(&self, txn: &mut Transaction) -> PluginResult<HookOutcome> {
        let existing: Vec<String> = txn
            .headers
            .get_all(HEADER)
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();

        match existing.as_slice() {
            [_] if txn.headers.count(HEADER) == 1 => {}
            [first, ..] => {
                debug!(count = txn.headers.count(HEADER), "Collapsing duplicate Message-ID headers");
                let first = first.clone();
                txn.headers.replace(HEADER, first);
            }
            [] => {
                let id = self.generate();
                debug!(message_id = %id, "Adding missing Message-ID");
                txn.headers.replace(HEADER, id);
                txn.set_note("message_id.generated", true);
            }
        }

        Ok(HookOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn run(raw: &[u8]) -> Transaction {
        let mut txn = Transaction::new(None);
        txn.set_message(raw).unwrap();
        MessageIdPlugin::new("mx.example.com")
            .on_body_complete(&mut txn)
            .await
            .unwrap();
        txn
    }

    #[tokio::test]
    async fn test_adds_missing_id() {
        let txn = run(b"Subject: hi\r\n\r\nbody").await;
        let id = txn.headers.get("message-id");
        assert!(id.starts_with('<') && id.ends_with("@mx.example.com>"));
        assert_eq!(txn.headers.count("Message-ID"), 1);
        assert_eq!(txn.note_as::<bool>("message_id.generated").unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_keeps_single_id() {
        let txn = run(b"Message-ID: <abc@example.com>\r\nSubject: hi\r\n\r\nbody").await;
        assert_eq!(
            txn.headers.serialize(),
            vec!["Message-ID: <abc@example.com>", "Subject: hi"]
        );
    }

    #[tokio::test]
    async fn test_collapses_duplicates() {
        let txn = run(b"Message-ID: <one@example.com>\r\nMessage-Id: <two@example.com>\r\n\r\nbody").await;
        assert_eq!(txn.headers.get_all("Message-ID"), vec!["<one@example.com>"]);
    }

    #[tokio::test]
    async fn test_replaces_empty_id() {
        let txn = run(b"Message-ID: \r\n\r\nbody").await;
        assert_eq!(txn.headers.count("Message-ID"), 1);
        assert!(txn.headers.get("Message-ID").ends_with("@mx.example.com>"));
    }

    #[tokio::test]
    async fn test_on_load_uses_hostname() {
        let mut plugin = MessageIdPlugin::default();
        plugin
            .on_load(&LoadContext::new("message_id", "relay.example.org", None))
            .await
            .unwrap();
        assert_eq!(plugin.domain, "relay.example.org");
    }
}
