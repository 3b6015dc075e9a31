//! Hook handler contract
//!
//! A handler is anything that can be started against a transaction and
//! eventually yields a [`HookOutcome`]. Asynchronous handlers return their
//! future directly; synchronous closures are wrapped in [`SyncHandler`].

use mailhook_common::types::{EmailAddress, HookOutcome};
use std::future::Future;
use std::pin::Pin;

use crate::plugins::PluginResult;
use crate::transaction::Transaction;

/// Future returned by a running handler, borrowing the transaction until it completes
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = PluginResult<HookOutcome>> + Send + 'a>>;

/// Event arguments passed alongside the transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookArgs {
    /// Recipient being added, set for `envelope_to` only
    pub recipient: Option<EmailAddress>,
}

impl HookArgs {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn recipient(rcpt: EmailAddress) -> Self {
        Self {
            recipient: Some(rcpt),
        }
    }
}

/// Handler registered for one hook
pub trait HookHandler: Send + Sync {
    fn call<'a>(&'a self, txn: &'a mut Transaction, args: &'a HookArgs) -> HookFuture<'a>;
}

impl<F> HookHandler for F
where
    F: for<'a> Fn(&'a mut Transaction, &'a HookArgs) -> HookFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, txn: &'a mut Transaction, args: &'a HookArgs) -> HookFuture<'a> {
        self(txn, args)
    }
}

/// Pin down the signature of an async handler closure.
///
/// Closures written as `|txn, args| Box::pin(async move { .. })` need the
/// higher-ranked bound in scope to infer their lifetimes.
pub fn async_handler<F>(f: F) -> F
where
    F: for<'a> Fn(&'a mut Transaction, &'a HookArgs) -> HookFuture<'a> + Send + Sync,
{
    f
}

/// Adapter for handlers that finish without suspending
pub struct SyncHandler<F>(pub F);

impl<F> HookHandler for SyncHandler<F>
where
    F: Fn(&mut Transaction, &HookArgs) -> PluginResult<HookOutcome> + Send + Sync,
{
    fn call<'a>(&'a self, txn: &'a mut Transaction, args: &'a HookArgs) -> HookFuture<'a> {
        // Run inside the future so a panic surfaces while it is polled
        Box::pin(async move { (self.0)(txn, args) })
    }
}
