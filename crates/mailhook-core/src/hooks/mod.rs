//! Hook System
//!
//! Registry of per-hook handler lists and the dispatcher that runs them
//! against a transaction with fail-open fault isolation.

mod dispatcher;
mod handler;
mod registry;

pub use dispatcher::{
    DispatchReport, DispatchState, Dispatcher, DispatcherConfig, FaultKind, HandlerFault,
};
pub use handler::{async_handler, HookArgs, HookFuture, HookHandler, SyncHandler};
pub use registry::{HookRegistry, RegisteredHandler};
