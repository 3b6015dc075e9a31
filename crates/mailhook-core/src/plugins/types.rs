//! Plugin Types
//!
//! Core types for the plugin system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailhook_common::types::{EmailAddress, HookName, HookOutcome};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::mime::MimeError;
use crate::transaction::{Transaction, TransactionError};

/// Plugin error types
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Malformed transaction: {0}")]
    Malformed(String),
    #[error("Plugin configuration error: {0}")]
    Config(String),
    #[error("Plugin secret unavailable: {0}")]
    Secret(String),
    #[error("Plugin timeout: {0}")]
    Timeout(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PluginError {
    /// Whether the error means expected transaction state was absent
    pub fn is_malformed(&self) -> bool {
        matches!(self, PluginError::Malformed(_))
    }
}

impl From<TransactionError> for PluginError {
    fn from(err: TransactionError) -> Self {
        PluginError::Malformed(err.to_string())
    }
}

impl From<MimeError> for PluginError {
    fn from(err: MimeError) -> Self {
        PluginError::Malformed(err.to_string())
    }
}

/// Plugin result type
pub type PluginResult<T> = Result<T, PluginError>;

/// Plugin status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Handlers are running normally
    Active,
    /// Recent handler faults, circuit still closed
    Degraded,
    /// Circuit open, handlers are bypassed
    CircuitOpen,
}

/// Plugin health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginHealth {
    pub status: PluginStatus,
    pub last_check: DateTime<Utc>,
    pub message: Option<String>,
    pub error_count: u32,
    pub success_count: u64,
    pub avg_response_ms: f64,
}

impl Default for PluginHealth {
    fn default() -> Self {
        Self {
            status: PluginStatus::Active,
            last_check: Utc::now(),
            message: None,
            error_count: 0,
            success_count: 0,
            avg_response_ms: 0.0,
        }
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Start-up context handed to [`Plugin::on_load`]
#[derive(Clone)]
pub struct LoadContext {
    plugin: String,
    hostname: String,
    settings: Option<toml::Value>,
    env: EnvLookup,
}

impl LoadContext {
    /// Context reading secrets from the process environment
    pub fn new(plugin: impl Into<String>, hostname: impl Into<String>, settings: Option<toml::Value>) -> Self {
        Self {
            plugin: plugin.into(),
            hostname: hostname.into(),
            settings,
            env: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Replace the environment lookup
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Host name this server announces
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Deserialize the `[plugins.<name>]` table, falling back to defaults when absent
    pub fn settings<T: DeserializeOwned + Default>(&self) -> PluginResult<T> {
        match &self.settings {
            None => Ok(T::default()),
            Some(value) => value.clone().try_into().map_err(|e: toml::de::Error| {
                PluginError::Config(format!("[plugins.{}]: {}", self.plugin, e))
            }),
        }
    }

    /// Read a secret from the named environment variable
    pub fn secret(&self, var: &str) -> PluginResult<String> {
        match (self.env)(var) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(PluginError::Secret(format!(
                "{} requires environment variable {}",
                self.plugin, var
            ))),
        }
    }
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("plugin", &self.plugin)
            .field("hostname", &self.hostname)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Plugin trait
///
/// Handlers receive the transaction for the duration of one hook call only.
/// Anything kept across calls must be process-wide and read-only after
/// [`Plugin::on_load`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name used in the pipeline manifest and in logs
    fn name(&self) -> &str;

    /// Hooks this plugin wants to be registered for
    fn hooks(&self) -> &[HookName];

    /// One-time setup before the plugin is registered
    async fn on_load(&mut self, _ctx: &LoadContext) -> PluginResult<()> {
        Ok(())
    }

    /// MAIL FROM accepted
    async fn on_envelope_from(&self, _txn: &mut Transaction) -> PluginResult<HookOutcome> {
        Ok(HookOutcome::Continue)
    }

    /// One RCPT TO. The recipient has not been added to the transaction yet.
    async fn on_envelope_to(
        &self,
        _txn: &mut Transaction,
        _rcpt: &EmailAddress,
    ) -> PluginResult<HookOutcome> {
        Ok(HookOutcome::Continue)
    }

    /// Full message available
    async fn on_body_complete(&self, _txn: &mut Transaction) -> PluginResult<HookOutcome> {
        Ok(HookOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Settings {
        threshold: f64,
        secret_env: Option<String>,
    }

    #[test]
    fn test_settings_default_when_absent() {
        let ctx = LoadContext::new("demo", "mx.example.com", None);
        assert_eq!(ctx.settings::<Settings>().unwrap(), Settings::default());
    }

    #[test]
    fn test_settings_from_table() {
        let table: toml::Value = toml::from_str("threshold = 4.5\nsecret_env = \"DEMO_KEY\"").unwrap();
        let ctx = LoadContext::new("demo", "mx.example.com", Some(table));
        let settings: Settings = ctx.settings().unwrap();
        assert_eq!(settings.threshold, 4.5);
        assert_eq!(settings.secret_env.as_deref(), Some("DEMO_KEY"));
    }

    #[test]
    fn test_settings_type_error() {
        let table: toml::Value = toml::from_str("threshold = \"high\"").unwrap();
        let ctx = LoadContext::new("demo", "mx.example.com", Some(table));
        let err = ctx.settings::<Settings>().unwrap_err();
        assert!(matches!(err, PluginError::Config(_)));
    }

    #[test]
    fn test_secret_lookup() {
        let ctx = LoadContext::new("demo", "mx.example.com", None)
            .with_env(|key| (key == "DEMO_KEY").then(|| "s3cret".to_string()));

        assert_eq!(ctx.secret("DEMO_KEY").unwrap(), "s3cret");
        assert!(matches!(ctx.secret("OTHER"), Err(PluginError::Secret(_))));
    }

    #[test]
    fn test_error_conversions() {
        let err: PluginError = TransactionError::NullSender.into();
        assert!(err.is_malformed());
        let err: PluginError = MimeError::NotALeaf("multipart/mixed".to_string()).into();
        assert!(err.is_malformed());
    }
}
