//! Plugin System
//!
//! The plugin contract, the loader that turns the configured plugin list
//! into a hook pipeline, and the built-in plugins.

mod attachment_filter;
mod dnsbl;
mod footer;
mod manager;
mod message_id;
mod received;
mod spam_score;
mod srs;
mod types;

pub use attachment_filter::{AttachmentFilterPlugin, BLOCKED_NOTE};
pub use dnsbl::{query_name, DnsLookup, DnsblPlugin, Listing, TrustDnsLookup, Zone, DNSBL_LISTED_NOTE};
pub use footer::{FooterPlugin, APPLIED_NOTE};
pub use manager::{Pipeline, PluginLoader};
pub use message_id::MessageIdPlugin;
pub use received::ReceivedPlugin;
pub use spam_score::{SpamScorePlugin, SPAM_SCORE_NOTE};
pub use srs::{SrsPlugin, ORIGINAL_SENDER_NOTE, REVERSED_NOTE};
pub use types::{LoadContext, Plugin, PluginError, PluginHealth, PluginResult, PluginStatus};
