//! Sender Rewriting Scheme
//!
//! Rewrites the envelope sender of forwarded mail to an address under the
//! local bounce domain, so SPF checks at the next hop see a domain we are
//! authorized for. Bounces to a rewritten address are verified and mapped
//! back to the original sender.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use mailhook_common::types::{EmailAddress, HookName, HookOutcome};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};

use super::types::{LoadContext, Plugin, PluginError, PluginResult};
use crate::transaction::Transaction;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "SRS0=";
const HASH_LEN: usize = 8;

/// Note holding the sender before rewriting
pub const ORIGINAL_SENDER_NOTE: &str = "srs.original_sender";
/// Note holding the original address behind an SRS recipient
pub const REVERSED_NOTE: &str = "srs.reversed";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Settings {
    /// Domain of rewritten addresses, defaults to the server hostname
    bounce_domain: Option<String>,
    /// Environment variable holding the HMAC key
    secret_env: String,
    /// Sender domains that are never rewritten
    local_domains: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bounce_domain: None,
            secret_env: "MAILHOOK_SRS_SECRET".to_string(),
            local_domains: Vec::new(),
        }
    }
}

/// Process-wide signing key, loaded once
#[derive(Clone)]
struct SrsKey(Vec<u8>);

impl std::fmt::Debug for SrsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SrsKey(..)")
    }
}

/// SRS0 rewriting of the envelope sender
#[derive(Debug, Default)]
pub struct SrsPlugin {
    key: Option<SrsKey>,
    bounce_domain: String,
    local_domains: Vec<String>,
}

impl SrsPlugin {
    pub const NAME: &'static str = "srs";

    pub fn new(secret: impl Into<Vec<u8>>, bounce_domain: impl Into<String>) -> Self {
        Self {
            key: Some(SrsKey(secret.into())),
            bounce_domain: bounce_domain.into(),
            local_domains: Vec::new(),
        }
    }

    pub fn with_local_domains(mut self, domains: Vec<String>) -> Self {
        self.local_domains = domains;
        self
    }

    fn key(&self) -> PluginResult<&SrsKey> {
        self.key
            .as_ref()
            .ok_or_else(|| PluginError::Internal("SRS secret not loaded".to_string()))
    }

    fn hash(&self, domain: &str, local: &str) -> PluginResult<String> {
        let key = self.key()?;
        let mut mac = HmacSha256::new_from_slice(&key.0)
            .map_err(|e| PluginError::Internal(format!("Invalid SRS key: {}", e)))?;
        mac.update(domain.to_ascii_lowercase().as_bytes());
        mac.update(b"=");
        mac.update(local.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(digest[..HASH_LEN].to_string())
    }

    /// `SRS0=<hash>=<domain>=<local>@<bounce_domain>`
    pub fn forward(&self, sender: &EmailAddress) -> PluginResult<EmailAddress> {
        let hash = self.hash(&sender.domain, &sender.local)?;
        Ok(EmailAddress::new(
            format!("{}{}={}={}", PREFIX, hash, sender.domain, sender.local),
            self.bounce_domain.clone(),
        ))
    }

    /// Original address behind an SRS0 address.
    ///
    /// `Ok(None)` when the address is not an SRS0 address for our bounce
    /// domain, an error when it is one but the hash does not verify.
    pub fn reverse(&self, address: &EmailAddress) -> PluginResult<Option<EmailAddress>> {
        if !self.is_bounce_domain(&address.domain) {
            return Ok(None);
        }
        let rest = match strip_prefix_ignore_case(&address.local, PREFIX) {
            Some(rest) => rest,
            None => return Ok(None),
        };

        let mut fields = rest.splitn(3, '=');
        let (hash, domain, local) = match (fields.next(), fields.next(), fields.next()) {
            (Some(h), Some(d), Some(l)) if !d.is_empty() && !l.is_empty() => (h, d, l),
            _ => return Err(PluginError::ExecutionFailed(format!("Malformed SRS address: {}", address))),
        };

        if !hash.eq_ignore_ascii_case(&self.hash(domain, local)?) {
            return Err(PluginError::ExecutionFailed(format!("SRS hash mismatch: {}", address)));
        }
        Ok(Some(EmailAddress::new(local, domain)))
    }

    fn is_bounce_domain(&self, domain: &str) -> bool {
        domain.eq_ignore_ascii_case(&self.bounce_domain)
    }

    fn is_local(&self, domain: &str) -> bool {
        self.is_bounce_domain(domain) || self.local_domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

#[async_trait]
impl Plugin for SrsPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &[HookName] {
        &[HookName::EnvelopeFrom, HookName::EnvelopeTo]
    }

    async fn on_load(&mut self, ctx: &LoadContext) -> PluginResult<()> {
        let settings: Settings = ctx.settings()?;
        let secret = ctx.secret(&settings.secret_env)?;

        self.key = Some(SrsKey(secret.into_bytes()));
        self.bounce_domain = settings
            .bounce_domain
            .unwrap_or_else(|| ctx.hostname().to_string());
        self.local_domains = settings.local_domains;
        info!(bounce_domain = %self.bounce_domain, "SRS key loaded");
        Ok(())
    }

    async fn on_envelope_from(&self, txn: &mut Transaction) -> PluginResult<HookOutcome> {
        let sender = match txn.mail_from() {
            Some(sender) => sender.clone(),
            None => return Ok(HookOutcome::Continue),
        };
        if self.is_local(&sender.domain) || strip_prefix_ignore_case(&sender.local, PREFIX).is_some() {
            return Ok(HookOutcome::Continue);
        }

        let rewritten = self.forward(&sender)?;
        debug!(from = %sender, to = %rewritten, "Rewriting envelope sender");

        let slot = txn.mail_from_mut()?;
        slot.local = rewritten.local;
        slot.domain = rewritten.domain;
        txn.set_note(ORIGINAL_SENDER_NOTE, sender.to_string());
        Ok(HookOutcome::Continue)
    }

    async fn on_envelope_to(&self, txn: &mut Transaction, rcpt: &EmailAddress) -> PluginResult<HookOutcome> {
        match self.reverse(rcpt) {
            Ok(Some(original)) => {
                txn.set_note(REVERSED_NOTE, original.to_string());
                Ok(HookOutcome::Continue)
            }
            Ok(None) => Ok(HookOutcome::Continue),
            Err(PluginError::ExecutionFailed(reason)) => {
                info!(recipient = %rcpt, "Rejecting invalid SRS recipient: {}", reason);
                Ok(HookOutcome::deny(550, "5.1.1 Invalid SRS address"))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plugin() -> SrsPlugin {
        SrsPlugin::new(b"test-secret".to_vec(), "bounce.example.org")
            .with_local_domains(vec!["example.org".to_string()])
    }

    #[tokio::test]
    async fn test_rewrites_foreign_sender() {
        let plugin = plugin();
        let mut txn = Transaction::new(Some(EmailAddress::new("alice", "example.com")));

        let outcome = plugin.on_envelope_from(&mut txn).await.unwrap();
        assert_eq!(outcome, HookOutcome::Continue);

        let sender = txn.mail_from().unwrap();
        assert_eq!(sender.domain, "bounce.example.org");
        assert!(sender.local.starts_with("SRS0="));
        assert!(sender.local.ends_with("=example.com=alice"));
        assert_eq!(
            txn.note_as::<String>(ORIGINAL_SENDER_NOTE).unwrap(),
            Some("alice@example.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_leaves_local_and_null_senders() {
        let plugin = plugin();

        let mut txn = Transaction::new(Some(EmailAddress::new("bob", "Example.ORG")));
        plugin.on_envelope_from(&mut txn).await.unwrap();
        assert_eq!(txn.mail_from().unwrap().local, "bob");
        assert!(txn.note(ORIGINAL_SENDER_NOTE).is_none());

        let mut txn = Transaction::new(None);
        plugin.on_envelope_from(&mut txn).await.unwrap();
        assert!(txn.mail_from().is_none());
    }

    #[test]
    fn test_forward_is_deterministic_and_reversible() {
        let plugin = plugin();
        let sender = EmailAddress::new("alice", "example.com");

        let first = plugin.forward(&sender).unwrap();
        assert_eq!(first, plugin.forward(&sender).unwrap());
        assert_eq!(plugin.reverse(&first).unwrap(), Some(sender));
    }

    #[test]
    fn test_reverse_rejects_tampering() {
        let plugin = plugin();
        let mut forged = plugin.forward(&EmailAddress::new("alice", "example.com")).unwrap();
        forged.local = forged.local.replace("alice", "mallory");

        assert!(plugin.reverse(&forged).is_err());
        assert_eq!(
            plugin.reverse(&EmailAddress::new("someone", "elsewhere.net")).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_invalid_srs_recipient_denied() {
        let plugin = plugin();
        let mut txn = Transaction::new(None);
        let rcpt = EmailAddress::new("SRS0=00000000=example.com=alice", "bounce.example.org");

        let outcome = plugin.on_envelope_to(&mut txn, &rcpt).await.unwrap();
        assert!(outcome.is_deny());

        let valid = plugin.forward(&EmailAddress::new("alice", "example.com")).unwrap();
        let outcome = plugin.on_envelope_to(&mut txn, &valid).await.unwrap();
        assert_eq!(outcome, HookOutcome::Continue);
        assert_eq!(
            txn.note_as::<String>(REVERSED_NOTE).unwrap(),
            Some("alice@example.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_on_load_requires_secret() {
        let mut plugin = SrsPlugin::default();
        let ctx = LoadContext::new("srs", "mx.example.org", None).with_env(|_| None);
        assert!(matches!(plugin.on_load(&ctx).await, Err(PluginError::Secret(_))));

        let ctx = LoadContext::new("srs", "mx.example.org", None)
            .with_env(|key| (key == "MAILHOOK_SRS_SECRET").then(|| "k".to_string()));
        plugin.on_load(&ctx).await.unwrap();
        let rewritten = plugin.forward(&EmailAddress::new("a", "example.com")).unwrap();
        assert_eq!(rewritten.domain, "mx.example.org");
    }

    #[tokio::test]
    async fn test_unloaded_plugin_faults() {
        let plugin = SrsPlugin::default();
        let mut txn = Transaction::new(Some(EmailAddress::new("alice", "example.com")));
        assert!(matches!(
            plugin.on_envelope_from(&mut txn).await,
            Err(PluginError::Internal(_))
        ));
    }
}
