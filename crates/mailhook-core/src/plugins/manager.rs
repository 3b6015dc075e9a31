//! Plugin Loader
//!
//! Builds the hook pipeline at start-up from the ordered plugin manifest,
//! using a compiled-in catalog of plugin constructors.

use mailhook_common::config::Config;
use mailhook_common::types::HookName;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::{LoadContext, Plugin, PluginError, PluginHealth, PluginResult};
use super::{
    AttachmentFilterPlugin, DnsblPlugin, FooterPlugin, MessageIdPlugin, ReceivedPlugin,
    SpamScorePlugin, SrsPlugin,
};
use crate::hooks::{
    DispatchReport, Dispatcher, DispatcherConfig, HookArgs, HookFuture, HookHandler, HookRegistry,
};
use crate::transaction::Transaction;

type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;
type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Routes one hook of a loaded plugin to the matching trait method
struct PluginHandler {
    plugin: Arc<dyn Plugin>,
    hook: HookName,
}

impl HookHandler for PluginHandler {
    fn call<'a>(&'a self, txn: &'a mut Transaction, args: &'a HookArgs) -> HookFuture<'a> {
        match self.hook {
            HookName::EnvelopeFrom => self.plugin.on_envelope_from(txn),
            HookName::EnvelopeTo => match args.recipient.as_ref() {
                Some(rcpt) => self.plugin.on_envelope_to(txn, rcpt),
                None => Box::pin(async {
                    Err(PluginError::Malformed(
                        "envelope_to dispatched without a recipient".to_string(),
                    ))
                }),
            },
            HookName::BodyComplete => self.plugin.on_body_complete(txn),
        }
    }
}

/// Catalog of plugin constructors, keyed by manifest name
#[derive(Clone, Default)]
pub struct PluginLoader {
    factories: HashMap<String, PluginFactory>,
    env: Option<EnvLookup>,
}

impl PluginLoader {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding every built-in plugin
    pub fn with_builtins() -> Self {
        let mut loader = Self::new();
        loader.register_factory(MessageIdPlugin::NAME, || Box::new(MessageIdPlugin::default()));
        loader.register_factory(ReceivedPlugin::NAME, || Box::new(ReceivedPlugin::default()));
        loader.register_factory(SrsPlugin::NAME, || Box::new(SrsPlugin::default()));
        loader.register_factory(DnsblPlugin::NAME, || Box::new(DnsblPlugin::default()));
        loader.register_factory(SpamScorePlugin::NAME, || Box::new(SpamScorePlugin::default()));
        loader.register_factory(AttachmentFilterPlugin::NAME, || {
            Box::new(AttachmentFilterPlugin::default())
        });
        loader.register_factory(FooterPlugin::NAME, || Box::new(FooterPlugin::default()));
        loader
    }

    /// Add or replace a catalog entry
    pub fn register_factory<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Replace the environment lookup used for plugin secrets
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Some(Arc::new(lookup));
        self
    }

    /// Catalog names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiate, load and register every plugin named in `[pipeline] plugins`.
    ///
    /// Registration follows manifest order, so handlers of the same hook run
    /// in the order the operator listed their plugins.
    pub async fn load(&self, config: &Config) -> PluginResult<Pipeline> {
        let mut registry = HookRegistry::new();
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::with_capacity(config.pipeline.plugins.len());

        for name in &config.pipeline.plugins {
            let factory = self.factories.get(name).ok_or_else(|| {
                PluginError::Config(format!("Unknown plugin in pipeline manifest: {}", name))
            })?;

            let mut plugin = factory();
            let mut ctx = LoadContext::new(
                name.clone(),
                config.server.hostname.clone(),
                config.plugin_settings(name).cloned(),
            );
            if let Some(env) = &self.env {
                let env = env.clone();
                ctx = ctx.with_env(move |key| env(key));
            }

            plugin.on_load(&ctx).await?;
            let plugin: Arc<dyn Plugin> = Arc::from(plugin);

            let mut registered = Vec::new();
            for hook in plugin.hooks() {
                if registered.contains(hook) {
                    continue;
                }
                registry.register(
                    *hook,
                    name.clone(),
                    Arc::new(PluginHandler {
                        plugin: plugin.clone(),
                        hook: *hook,
                    }),
                );
                registered.push(*hook);
            }

            debug!(plugin = %name, hooks = ?registered, "Plugin registered");
            plugins.push(plugin);
        }

        info!(
            plugins = plugins.len(),
            handlers = registry.len(),
            "Plugin pipeline loaded"
        );

        Ok(Pipeline {
            dispatcher: Dispatcher::with_config(registry, DispatcherConfig::from(&config.pipeline)),
            plugins,
        })
    }
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("factories", &self.names())
            .finish_non_exhaustive()
    }
}

/// Loaded plugins and the dispatcher running their handlers.
///
/// Shared read-only by every session once built.
pub struct Pipeline {
    dispatcher: Dispatcher,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Pipeline {
    /// Pipeline over hand-registered handlers, with no plugin objects behind them
    pub fn from_registry(registry: HookRegistry) -> Self {
        Self::with_config(registry, DispatcherConfig::default())
    }

    pub fn with_config(registry: HookRegistry, config: DispatcherConfig) -> Self {
        Self {
            dispatcher: Dispatcher::with_config(registry, config),
            plugins: Vec::new(),
        }
    }

    pub async fn dispatch(&self, hook: HookName, txn: &mut Transaction, args: &HookArgs) -> DispatchReport {
        self.dispatcher.dispatch(hook, txn, args).await
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Names of loaded plugins in manifest order
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub async fn plugin_health(&self) -> HashMap<String, PluginHealth> {
        self.dispatcher.plugin_health().await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("plugins", &self.plugin_names())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mailhook_common::types::{EmailAddress, HookOutcome};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Default)]
    struct Tagger {
        tag: String,
    }

    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct TaggerSettings {
        tag: String,
    }

    #[async_trait]
    impl Plugin for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }

        fn hooks(&self) -> &[HookName] {
            &[HookName::EnvelopeTo, HookName::BodyComplete]
        }

        async fn on_load(&mut self, ctx: &LoadContext) -> PluginResult<()> {
            self.tag = ctx.settings::<TaggerSettings>()?.tag;
            Ok(())
        }

        async fn on_envelope_to(&self, txn: &mut Transaction, rcpt: &EmailAddress) -> PluginResult<HookOutcome> {
            txn.set_note("tagger.rcpt", rcpt.to_string());
            Ok(HookOutcome::Continue)
        }

        async fn on_body_complete(&self, txn: &mut Transaction) -> PluginResult<HookOutcome> {
            txn.headers.add("X-Tag", self.tag.clone());
            Ok(HookOutcome::Continue)
        }
    }

    fn config(toml: &str) -> Config {
        Config::from_toml(toml).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_plugin_rejected() {
        let loader = PluginLoader::new();
        let err = loader
            .load(&config("[pipeline]\nplugins = [\"nope\"]"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_registers_declared_hooks() {
        let mut loader = PluginLoader::new();
        loader.register_factory("tagger", || Box::new(Tagger::default()));

        let pipeline = loader
            .load(&config(
                "[pipeline]\nplugins = [\"tagger\"]\n\n[plugins.tagger]\ntag = \"blue\"\n",
            ))
            .await
            .unwrap();

        assert_eq!(pipeline.plugin_names(), vec!["tagger"]);
        let registry = pipeline.dispatcher().registry();
        assert_eq!(registry.hooks(), vec![HookName::EnvelopeTo, HookName::BodyComplete]);

        let mut txn = Transaction::new(None);
        let args = HookArgs::recipient(EmailAddress::new("bob", "example.net"));
        pipeline.dispatch(HookName::EnvelopeTo, &mut txn, &args).await;
        assert_eq!(
            txn.note_as::<String>("tagger.rcpt").unwrap(),
            Some("bob@example.net".to_string())
        );

        txn.set_message(b"Subject: x\r\n\r\nbody").unwrap();
        pipeline.dispatch(HookName::BodyComplete, &mut txn, &HookArgs::none()).await;
        assert_eq!(txn.headers.get("X-Tag"), "blue");
    }

    #[tokio::test]
    async fn test_envelope_to_without_recipient_is_malformed() {
        let mut loader = PluginLoader::new();
        loader.register_factory("tagger", || Box::new(Tagger::default()));
        let pipeline = loader
            .load(&config("[pipeline]\nplugins = [\"tagger\"]"))
            .await
            .unwrap();

        let mut txn = Transaction::new(None);
        let report = pipeline.dispatch(HookName::EnvelopeTo, &mut txn, &HookArgs::none()).await;
        assert_eq!(report.outcome, HookOutcome::Continue);
        assert_eq!(report.faults.len(), 1);
    }

    #[test]
    fn test_builtin_catalog() {
        let loader = PluginLoader::with_builtins();
        assert_eq!(
            loader.names(),
            vec![
                "attachment_filter",
                "dnsbl",
                "footer",
                "message_id",
                "received",
                "spam_score",
                "srs",
            ]
        );
    }
}
