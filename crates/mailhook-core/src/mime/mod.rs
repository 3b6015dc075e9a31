//! MIME Model
//!
//! A parsed message body as a tree of [`Part`]s. Leaf bodies are kept as the
//! exact bytes received so a parse/serialize round trip leaves untouched
//! parts byte-identical.

mod encoding;
mod part;
mod traverse;

pub use encoding::{decode_transfer, encode_transfer};
pub use part::{split_header_block, Part, MAX_DEPTH};
pub use traverse::{find_leaf, find_leaf_mut, leaves, leaves_mut, replace_leaf_body, Leaves};

use thiserror::Error;

/// MIME traversal and mutation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MimeError {
    #[error("Part is a multipart container, not a leaf: {0}")]
    NotALeaf(String),
    #[error("Failed to decode {encoding} body: {message}")]
    Decode { encoding: String, message: String },
}
