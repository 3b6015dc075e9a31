//! Hook Registry
//!
//! Ordered handler lists per hook. Order is registration order, which the
//! loader derives from the operator's plugin manifest.

use mailhook_common::types::{HookName, HookOutcome};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::handler::{HookArgs, HookFuture, HookHandler, SyncHandler};
use crate::plugins::PluginResult;
use crate::transaction::Transaction;

/// A handler together with the plugin that registered it
#[derive(Clone)]
pub struct RegisteredHandler {
    pub plugin: String,
    pub handler: Arc<dyn HookHandler>,
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

/// Hook name to ordered handler list
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    handlers: HashMap<HookName, Vec<RegisteredHandler>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `hook`
    pub fn register(&mut self, hook: HookName, plugin: impl Into<String>, handler: Arc<dyn HookHandler>) {
        self.handlers.entry(hook).or_default().push(RegisteredHandler {
            plugin: plugin.into(),
            handler,
        });
    }

    /// Append an async closure handler
    pub fn register_async<F>(&mut self, hook: HookName, plugin: impl Into<String>, f: F)
    where
        F: for<'a> Fn(&'a mut Transaction, &'a HookArgs) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.register(hook, plugin, Arc::new(f));
    }

    /// Append a closure handler that completes without suspending
    pub fn register_sync<F>(&mut self, hook: HookName, plugin: impl Into<String>, f: F)
    where
        F: Fn(&mut Transaction, &HookArgs) -> PluginResult<HookOutcome> + Send + Sync + 'static,
    {
        self.register(hook, plugin, Arc::new(SyncHandler(f)));
    }

    /// Handlers for `hook` in execution order
    pub fn handlers(&self, hook: HookName) -> &[RegisteredHandler] {
        self.handlers.get(&hook).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hooks with at least one handler, in pipeline order
    pub fn hooks(&self) -> Vec<HookName> {
        HookName::ALL
            .into_iter()
            .filter(|hook| !self.handlers(*hook).is_empty())
            .collect()
    }

    /// Plugin names in the order they first appear, walking hooks in pipeline order
    pub fn plugins(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for hook in HookName::ALL {
            for entry in self.handlers(hook) {
                if !names.contains(&entry.plugin.as_str()) {
                    names.push(&entry.plugin);
                }
            }
        }
        names
    }

    /// Total number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn noop(_txn: &mut Transaction, _args: &HookArgs) -> PluginResult<HookOutcome> {
        Ok(HookOutcome::Continue)
    }

    #[test]
    fn test_registration_order() {
        let mut registry = HookRegistry::new();
        registry.register_sync(HookName::BodyComplete, "first", noop);
        registry.register_sync(HookName::EnvelopeFrom, "second", noop);
        registry.register_sync(HookName::BodyComplete, "third", noop);

        let names: Vec<&str> = registry
            .handlers(HookName::BodyComplete)
            .iter()
            .map(|h| h.plugin.as_str())
            .collect();
        assert_eq!(names, vec!["first", "third"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_hooks_and_plugins() {
        let mut registry = HookRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.handlers(HookName::EnvelopeTo).is_empty());

        registry.register_sync(HookName::BodyComplete, "footer", noop);
        registry.register_sync(HookName::EnvelopeFrom, "srs", noop);
        registry.register_sync(HookName::BodyComplete, "srs", noop);

        assert_eq!(
            registry.hooks(),
            vec![HookName::EnvelopeFrom, HookName::BodyComplete]
        );
        assert_eq!(registry.plugins(), vec!["srs", "footer"]);
    }
}
