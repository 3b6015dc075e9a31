//! Mailhook Core - ordered hook pipeline for an MTA
//!
//! This crate provides the transaction model handed to plugins, the header
//! store and MIME tree they edit, the hook registry and fail-open dispatcher,
//! the plugin contract with its built-in plugins, and the session type the
//! SMTP engine drives.

pub mod headers;
pub mod hooks;
pub mod mime;
pub mod plugins;
pub mod session;
pub mod spam;
pub mod transaction;

pub use headers::HeaderStore;
pub use hooks::{DispatchReport, DispatchState, Dispatcher, DispatcherConfig, HookArgs, HookHandler, HookRegistry};
pub use mime::{MimeError, Part};
pub use plugins::{LoadContext, Pipeline, Plugin, PluginError, PluginLoader, PluginResult};
pub use session::{DataResult, QueuedMessage, Session, SessionError};
pub use spam::{SpamAction, SpamCheckResult, SpamFilter};
pub use transaction::{Phase, Transaction, TransactionError};
