//! MIME part tree: parsing and re-serialization

use crate::headers::{split_parameters, HeaderStore};

use super::encoding::{decode_transfer, encode_transfer};
use super::MimeError;

/// Nesting depth beyond which multipart bodies are kept as opaque leaves
pub const MAX_DEPTH: usize = 64;

/// Boundary layout of a multipart container, kept for re-serialization
#[derive(Debug, Clone, PartialEq, Eq)]
struct Multipart {
    boundary: String,
    preamble: Vec<u8>,
    epilogue: Vec<u8>,
    closed: bool,
}

/// One node of the MIME tree.
///
/// A part is either a leaf (no children, `raw_body` holds the content as
/// received, still transfer-encoded) or a container (children non-empty,
/// `raw_body` unused).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Headers of this part. For the root this is a copy of the message's
    /// `Content-*` fields, the message headers themselves live in the transaction.
    pub headers: HeaderStore,
    /// Lower-cased media type, e.g. `text/html`
    pub content_type: String,
    transfer_encoding: String,
    raw_body: Vec<u8>,
    children: Vec<Part>,
    multipart: Option<Multipart>,
}

impl Default for Part {
    fn default() -> Self {
        Self::leaf("text/plain", Vec::new())
    }
}

impl Part {
    /// Create a leaf part with no headers
    pub fn leaf(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HeaderStore::new(),
            content_type: content_type.into().to_ascii_lowercase(),
            transfer_encoding: "7bit".to_string(),
            raw_body: body.into(),
            children: Vec::new(),
            multipart: None,
        }
    }

    /// Parse a body part that carries its own header block
    pub fn parse(bytes: &[u8]) -> Self {
        Self::parse_at(bytes, 0)
    }

    /// Parse the root body of a message whose headers were parsed separately.
    ///
    /// `content_type` and `transfer_encoding` are the raw values of the
    /// message's `Content-Type` and `Content-Transfer-Encoding` headers.
    pub fn parse_body(
        content_type: Option<&str>,
        transfer_encoding: Option<&str>,
        body: &[u8],
    ) -> Self {
        Self::build(HeaderStore::new(), content_type, transfer_encoding, body, 0)
    }

    /// Parse the root body of a message, reading its media type, transfer
    /// encoding, charset and disposition from the message headers
    pub fn parse_root(message_headers: &HeaderStore, body: &[u8]) -> Self {
        let headers = message_headers.with_prefix("Content-");
        let content_type = headers.find("Content-Type").map(str::to_string);
        let encoding = headers.find("Content-Transfer-Encoding").map(str::to_string);
        Self::build(headers, content_type.as_deref(), encoding.as_deref(), body, 0)
    }

    fn parse_at(bytes: &[u8], depth: usize) -> Self {
        let (header_block, body) = split_header_block(bytes);
        let headers = HeaderStore::parse(header_block);
        let content_type = headers.find("Content-Type").map(str::to_string);
        let encoding = headers.find("Content-Transfer-Encoding").map(str::to_string);
        Self::build(headers, content_type.as_deref(), encoding.as_deref(), body, depth)
    }

    fn build(
        headers: HeaderStore,
        content_type: Option<&str>,
        transfer_encoding: Option<&str>,
        body: &[u8],
        depth: usize,
    ) -> Self {
        let (media_type, params) = match content_type {
            Some(value) => split_parameters(value),
            None => ("text/plain".to_string(), Vec::new()),
        };
        let media_type = if media_type.is_empty() {
            "text/plain".to_string()
        } else {
            media_type.to_ascii_lowercase()
        };
        let transfer_encoding = transfer_encoding
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "7bit".to_string());

        let mut part = Self {
            headers,
            content_type: media_type,
            transfer_encoding,
            raw_body: Vec::new(),
            children: Vec::new(),
            multipart: None,
        };

        let boundary = params
            .into_iter()
            .find(|(k, _)| k == "boundary")
            .map(|(_, v)| v)
            .filter(|b| !b.is_empty());

        if part.content_type.starts_with("multipart/") && depth < MAX_DEPTH {
            if let Some(boundary) = boundary {
                if let Some(split) = split_multipart(body, &boundary) {
                    part.children = split
                        .parts
                        .iter()
                        .map(|bytes| Self::parse_at(bytes, depth + 1))
                        .collect();
                    part.multipart = Some(Multipart {
                        boundary,
                        preamble: split.preamble.to_vec(),
                        epilogue: split.epilogue.to_vec(),
                        closed: split.closed,
                    });
                    return part;
                }
            }
        }

        part.raw_body = body.to_vec();
        part
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type.starts_with("multipart/")
    }

    pub fn children(&self) -> &[Part] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Part] {
        &mut self.children
    }

    /// Boundary of a multipart container
    pub fn boundary(&self) -> Option<&str> {
        self.multipart.as_ref().map(|m| m.boundary.as_str())
    }

    /// Body bytes as received (transfer-encoded)
    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    /// Lower-cased Content-Transfer-Encoding, `7bit` when absent
    pub fn transfer_encoding(&self) -> &str {
        &self.transfer_encoding
    }

    /// `charset` parameter of the Content-Type header
    pub fn charset(&self) -> Option<String> {
        let (_, params) = split_parameters(self.headers.find("Content-Type")?);
        params
            .into_iter()
            .find(|(k, _)| k == "charset")
            .map(|(_, v)| v.to_ascii_lowercase())
    }

    /// Attachment file name from Content-Disposition or the Content-Type `name`
    pub fn filename(&self) -> Option<String> {
        let from = |header: &str, key: &str| {
            let (_, params) = split_parameters(self.headers.find(header)?);
            params
                .into_iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v)
                .filter(|v| !v.is_empty())
        };
        from("Content-Disposition", "filename").or_else(|| from("Content-Type", "name"))
    }

    /// Whether the part is marked as an attachment or names a file
    pub fn is_attachment(&self) -> bool {
        let disposition = self.headers.get("Content-Disposition");
        disposition
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("attachment")
            || self.filename().is_some()
    }

    /// Replace the raw (transfer-encoded) body of a leaf
    pub fn set_raw_body(&mut self, body: impl Into<Vec<u8>>) -> Result<(), MimeError> {
        if !self.is_leaf() {
            return Err(MimeError::NotALeaf(self.content_type.clone()));
        }
        self.raw_body = body.into();
        Ok(())
    }

    /// Body with the transfer encoding removed
    pub fn decoded_body(&self) -> Result<Vec<u8>, MimeError> {
        if !self.is_leaf() {
            return Err(MimeError::NotALeaf(self.content_type.clone()));
        }
        decode_transfer(&self.transfer_encoding, &self.raw_body)
    }

    /// Decoded body as text, replacing invalid UTF-8
    pub fn text(&self) -> Result<String, MimeError> {
        Ok(String::from_utf8_lossy(&self.decoded_body()?).into_owned())
    }

    /// Replace the body with new content, re-applying the part's transfer encoding
    pub fn set_decoded_body(&mut self, data: &[u8]) -> Result<(), MimeError> {
        let encoded = encode_transfer(&self.transfer_encoding, data);
        self.set_raw_body(encoded)
    }

    /// Serialize headers, separator and body
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw_body.len() + 256);
        self.write_part(&mut out);
        out
    }

    /// Serialize the body only (root parts)
    pub fn serialize_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw_body.len() + 256);
        self.write_body(&mut out);
        out
    }

    fn write_part(&self, out: &mut Vec<u8>) {
        self.headers.write_to(out);
        out.extend_from_slice(b"\r\n");
        self.write_body(out);
    }

    pub(crate) fn write_body(&self, out: &mut Vec<u8>) {
        let layout = match (&self.multipart, self.children.is_empty()) {
            (Some(layout), false) => layout,
            _ => {
                out.extend_from_slice(&self.raw_body);
                return;
            }
        };

        out.extend_from_slice(&layout.preamble);
        let last = self.children.len() - 1;
        for (i, child) in self.children.iter().enumerate() {
            out.extend_from_slice(b"--");
            out.extend_from_slice(layout.boundary.as_bytes());
            out.extend_from_slice(b"\r\n");
            child.write_part(out);
            if i < last || layout.closed {
                out.extend_from_slice(b"\r\n");
            }
        }
        if layout.closed {
            out.extend_from_slice(b"--");
            out.extend_from_slice(layout.boundary.as_bytes());
            out.extend_from_slice(b"--");
            out.extend_from_slice(&layout.epilogue);
        }
    }
}

/// Split raw bytes at the first empty line into (header block, body).
///
/// When the first line is not a header field the whole input is body.
/// When no empty line exists the whole input is headers.
pub fn split_header_block(bytes: &[u8]) -> (&[u8], &[u8]) {
    let mut pos = 0;
    let mut first = true;

    while pos < bytes.len() {
        let (line_end, next) = match bytes[pos..].iter().position(|&b| b == b'\n') {
            Some(offset) => (pos + offset, pos + offset + 1),
            None => (bytes.len(), bytes.len()),
        };
        let mut line = &bytes[pos..line_end];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }

        if line.is_empty() {
            return (&bytes[..pos], &bytes[next..]);
        }
        if first && !looks_like_field(line) {
            return (&bytes[..0], bytes);
        }

        first = false;
        pos = next;
    }

    (bytes, &bytes[bytes.len()..])
}

fn looks_like_field(line: &[u8]) -> bool {
    match line.iter().position(|&b| b == b':') {
        Some(colon) => colon > 0 && !line[..colon].iter().any(|b| b.is_ascii_whitespace()),
        None => false,
    }
}

struct MultipartSplit<'a> {
    preamble: &'a [u8],
    parts: Vec<&'a [u8]>,
    epilogue: &'a [u8],
    closed: bool,
}

enum Delimiter {
    Open,
    Close,
}

fn classify_line(line: &[u8], boundary: &[u8]) -> Option<(Delimiter, usize)> {
    let rest = line.strip_prefix(b"--")?.strip_prefix(boundary)?;
    let token_len = 2 + boundary.len();

    if let Some(after) = rest.strip_prefix(b"--") {
        if after.iter().all(|b| b.is_ascii_whitespace()) {
            return Some((Delimiter::Close, token_len + 2));
        }
        return None;
    }
    if rest.iter().all(|b| b.is_ascii_whitespace()) {
        return Some((Delimiter::Open, token_len));
    }
    None
}

/// Position of the line break that precedes `line_start`, bounded by `floor`
fn strip_preceding_break(bytes: &[u8], floor: usize, line_start: usize) -> usize {
    let mut end = line_start;
    if end > floor && bytes[end - 1] == b'\n' {
        end -= 1;
        if end > floor && bytes[end - 1] == b'\r' {
            end -= 1;
        }
    }
    end
}

/// A container without body parts is kept as a leaf
fn non_empty(split: MultipartSplit<'_>) -> Option<MultipartSplit<'_>> {
    if split.parts.is_empty() {
        None
    } else {
        Some(split)
    }
}

fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Option<MultipartSplit<'a>> {
    let boundary = boundary.as_bytes();
    let mut preamble: Option<&[u8]> = None;
    let mut parts = Vec::new();
    let mut current_start = 0;
    let mut pos = 0;

    while pos < body.len() {
        let (line_end, next) = match body[pos..].iter().position(|&b| b == b'\n') {
            Some(offset) => (pos + offset, pos + offset + 1),
            None => (body.len(), body.len()),
        };

        if let Some((kind, token_len)) = classify_line(&body[pos..line_end], boundary) {
            match preamble {
                None => preamble = Some(&body[..pos]),
                Some(_) => {
                    let end = strip_preceding_break(body, current_start, pos);
                    parts.push(&body[current_start..end]);
                }
            }

            if let Delimiter::Close = kind {
                return non_empty(MultipartSplit {
                    preamble: preamble.unwrap_or_default(),
                    parts,
                    epilogue: &body[pos + token_len..],
                    closed: true,
                });
            }
            current_start = next;
        }

        pos = next;
    }

    let preamble = preamble?;
    if current_start < body.len() {
        parts.push(&body[current_start..]);
    }
    non_empty(MultipartSplit {
        preamble,
        parts,
        epilogue: &body[body.len()..],
        closed: false,
    })
}
