//! Mailhook Common - Shared types and configuration
//!
//! This crate provides the envelope and hook types, the configuration
//! model, and the error type shared by every Mailhook component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{EmailAddress, HookName, HookOutcome, Reply};
