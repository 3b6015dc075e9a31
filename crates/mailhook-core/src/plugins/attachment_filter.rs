//! Attachment policy

use async_trait::async_trait;
use mailhook_common::types::{HookName, HookOutcome};
use serde::Deserialize;
use tracing::info;

use super::types::{LoadContext, Plugin, PluginResult};
use crate::mime::{leaves, Part};
use crate::transaction::Transaction;

/// Note naming the part that caused a rejection
pub const BLOCKED_NOTE: &str = "attachment_filter.blocked";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Settings {
    /// Media types, `type/*` matches a whole top-level type
    blocked_types: Vec<String>,
    /// File name extensions, without the dot
    blocked_extensions: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            blocked_types: vec![
                "application/x-msdownload".to_string(),
                "application/x-dosexec".to_string(),
            ],
            blocked_extensions: ["exe", "scr", "bat", "cmd", "com", "pif", "vbs", "js", "jar"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Rejects messages carrying blocked attachment types
#[derive(Debug, Default)]
pub struct AttachmentFilterPlugin {
    settings: Settings,
}

impl AttachmentFilterPlugin {
    pub const NAME: &'static str = "attachment_filter";

    pub fn new(blocked_types: Vec<String>, blocked_extensions: Vec<String>) -> Self {
        Self {
            settings: Settings {
                blocked_types,
                blocked_extensions,
            },
        }
    }

    fn type_blocked(&self, content_type: &str) -> bool {
        self.settings.blocked_types.iter().any(|blocked| {
            match blocked.strip_suffix("/*") {
                Some(top) => content_type
                    .split('/')
                    .next()
                    .map(|t| t.eq_ignore_ascii_case(top))
                    .unwrap_or(false),
                None => blocked.eq_ignore_ascii_case(content_type),
            }
        })
    }

    fn extension_blocked(&self, filename: &str) -> bool {
        match filename.rsplit_once('.') {
            Some((_, ext)) => self
                .settings
                .blocked_extensions
                .iter()
                .any(|blocked| blocked.trim_start_matches('.').eq_ignore_ascii_case(ext.trim())),
            None => false,
        }
    }

    /// Name (file name or media type) of the first blocked part
    fn first_blocked(&self, root: &Part) -> Option<String> {
        leaves(root).find_map(|part| {
            let filename = part.filename();
            if self.type_blocked(&part.content_type) {
                return Some(filename.unwrap_or_else(|| part.content_type.clone()));
            }
            filename.filter(|name| self.extension_blocked(name))
        })
    }
}

#[async_trait]
impl Plugin for AttachmentFilterPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &[HookName] {
        &[HookName::BodyComplete]
    }

    async fn on_load(&mut self, ctx: &LoadContext) -> PluginResult<()> {
        self.settings = ctx.settings()?;
        Ok(())
    }

    async fn on_body_complete(&self, txn: &mut Transaction) -> PluginResult<HookOutcome> {
        match self.first_blocked(&txn.body) {
            Some(name) => {
                info!(attachment = %name, "Blocked attachment");
                let reply = format!("5.7.1 Message contains a blocked attachment: {}", name);
                txn.set_note(BLOCKED_NOTE, name);
                Ok(HookOutcome::deny(554, reply))
            }
            None => Ok(HookOutcome::Continue),
        }
    }
}
