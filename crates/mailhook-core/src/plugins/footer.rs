//! Footer injection into text parts

use async_trait::async_trait;
use mailhook_common::types::{HookName, HookOutcome};
use serde::Deserialize;
use tracing::debug;

use super::types::{LoadContext, Plugin, PluginError, PluginResult};
use crate::mime::{leaves_mut, Part};
use crate::transaction::Transaction;

/// Note holding how many parts received the footer
pub const APPLIED_NOTE: &str = "footer.applied";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Settings {
    text: String,
    /// HTML variant, defaults to the escaped plain text in a paragraph
    html: Option<String>,
}

/// Appends a footer to the first plain-text and the first HTML body part
#[derive(Debug, Default)]
pub struct FooterPlugin {
    text: String,
    html: String,
}

impl FooterPlugin {
    pub const NAME: &'static str = "footer";

    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let html = format!("<p>{}</p>", escape_html(&text));
        Self { text, html }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    fn append_plain(&self, part: &mut Part, body: &str) -> PluginResult<bool> {
        if body.contains(&self.text) {
            return Ok(false);
        }

        let mut updated = body.trim_end_matches(['\r', '\n']).to_string();
        updated.push_str("\r\n\r\n-- \r\n");
        updated.push_str(&self.text);
        updated.push_str("\r\n");
        part.set_decoded_body(updated.as_bytes())?;
        Ok(true)
    }

    fn append_html(&self, part: &mut Part, body: &str) -> PluginResult<bool> {
        if body.contains(&self.html) {
            return Ok(false);
        }

        let updated = match body.to_ascii_lowercase().rfind("</body>") {
            Some(pos) => format!("{}{}\r\n{}", &body[..pos], self.html, &body[pos..]),
            None => format!("{}\r\n{}\r\n", body.trim_end_matches(['\r', '\n']), self.html),
        };
        part.set_decoded_body(updated.as_bytes())?;
        Ok(true)
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("<br>"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Decoded text of a body part we can safely rewrite as UTF-8
fn editable(part: &Part, media_type: &str) -> Option<String> {
    if part.content_type != media_type || part.is_attachment() {
        return None;
    }
    let charset_ok = part
        .charset()
        .map(|c| c == "utf-8" || c == "us-ascii")
        .unwrap_or(true);
    if !charset_ok {
        return None;
    }
    String::from_utf8(part.decoded_body().ok()?).ok()
}

#[async_trait]
impl Plugin for FooterPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &[HookName] {
        &[HookName::BodyComplete]
    }

    async fn on_load(&mut self, ctx: &LoadContext) -> PluginResult<()> {
        let settings: Settings = ctx.settings()?;
        if settings.text.trim().is_empty() {
            return Err(PluginError::Config("footer text must not be empty".to_string()));
        }
        *self = Self::new(settings.text);
        if let Some(html) = settings.html {
            self.html = html;
        }
        Ok(())
    }

    async fn on_body_complete(&self, txn: &mut Transaction) -> PluginResult<HookOutcome> {
        let mut applied = 0;
        let mut plain_done = false;
        let mut html_done = false;

        for part in leaves_mut(&mut txn.body) {
            if !plain_done {
                if let Some(body) = editable(part, "text/plain") {
                    plain_done = true;
                    if self.append_plain(part, &body)? {
                        applied += 1;
                    }
                    continue;
                }
            }
            if !html_done {
                if let Some(body) = editable(part, "text/html") {
                    html_done = true;
                    if self.append_html(part, &body)? {
                        applied += 1;
                    }
                }
            }
        }

        if !plain_done && !html_done {
            return Err(PluginError::Malformed("no text part to carry the footer".to_string()));
        }

        debug!(parts = applied, "Footer applied");
        txn.set_note(APPLIED_NOTE, applied);
        Ok(HookOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::{find_leaf, leaves};
    use pretty_assertions::assert_eq;

    const ALTERNATIVE: &[u8] = b"Subject: hi\r\n\
Content-Type: multipart/alternative; boundary=alt\r\n\
\r\n\
--alt\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello\r\n\
--alt\r\n\
Content-Type: text/html\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
<html><body><p>Hello</p></body></html>\r\n\
--alt--\r\n";

    fn txn(raw: &[u8]) -> Transaction {
        let mut txn = Transaction::new(None);
        txn.set_message(raw).unwrap();
        txn
    }

    #[tokio::test]
    async fn test_appends_to_both_alternatives() {
        let plugin = FooterPlugin::new("Sent via example.org");
        let mut txn = txn(ALTERNATIVE);

        plugin.on_body_complete(&mut txn).await.unwrap();

        let plain = find_leaf(&txn.body, "text/plain").unwrap();
        assert_eq!(plain.text().unwrap(), "Hello\r\n\r\n-- \r\nSent via example.org\r\n");

        let html = find_leaf(&txn.body, "text/html").unwrap();
        assert_eq!(
            html.text().unwrap(),
            "<html><body><p>Hello</p><p>Sent via example.org</p>\r\n</body></html>"
        );
        assert_eq!(txn.note_as::<u32>(APPLIED_NOTE).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let plugin = FooterPlugin::new("Sent via example.org");
        let mut txn = txn(ALTERNATIVE);

        plugin.on_body_complete(&mut txn).await.unwrap();
        let once = txn.to_bytes();
        plugin.on_body_complete(&mut txn).await.unwrap();

        assert_eq!(txn.to_bytes(), once);
        assert_eq!(txn.note_as::<u32>(APPLIED_NOTE).unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_attachments_untouched() {
        let raw = b"Content-Type: multipart/mixed; boundary=m\r\n\r\n\
--m\r\nContent-Type: text/plain\r\nContent-Disposition: attachment; filename=notes.txt\r\n\r\nnotes\r\n\
--m\r\nContent-Type: text/plain\r\n\r\nbody\r\n\
--m--\r\n";
        let mut txn = txn(raw);
        FooterPlugin::new("footer").on_body_complete(&mut txn).await.unwrap();

        let texts: Vec<String> = leaves(&txn.body).map(|p| p.text().unwrap()).collect();
        assert_eq!(texts[0], "notes");
        assert_eq!(texts[1], "body\r\n\r\n-- \r\nfooter\r\n");
    }

    #[tokio::test]
    async fn test_no_text_part_is_malformed() {
        let mut txn = txn(b"Content-Type: image/png\r\n\r\nPNG");
        let err = FooterPlugin::new("footer")
            .on_body_complete(&mut txn)
            .await
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_latin1_single_part_untouched() {
        let raw = b"Subject: menu\r\nContent-Type: text/plain; charset=iso-8859-1\r\n\r\ncaf\xe9\r\n";
        let mut txn = txn(raw);
        let err = FooterPlugin::new("footer")
            .on_body_complete(&mut txn)
            .await
            .unwrap_err();

        assert!(err.is_malformed());
        assert_eq!(txn.to_bytes(), raw.to_vec());
    }

    #[tokio::test]
    async fn test_invalid_utf8_body_untouched() {
        let raw = b"Content-Type: text/plain; charset=utf-8\r\n\r\ncaf\xe9\r\n";
        let mut txn = txn(raw);
        assert!(FooterPlugin::new("footer").on_body_complete(&mut txn).await.is_err());
        assert_eq!(txn.to_bytes(), raw.to_vec());
    }

    #[tokio::test]
    async fn test_single_part_plain() {
        let mut txn = txn(b"Subject: s\r\nContent-Type: text/plain; charset=us-ascii\r\n\r\nhi\r\n");
        FooterPlugin::new("footer").on_body_complete(&mut txn).await.unwrap();
        assert_eq!(txn.body.text().unwrap(), "hi\r\n\r\n-- \r\nfooter\r\n");
    }

    #[tokio::test]
    async fn test_on_load_requires_text() {
        let mut plugin = FooterPlugin::default();
        let ctx = LoadContext::new("footer", "mx", None);
        assert!(matches!(plugin.on_load(&ctx).await, Err(PluginError::Config(_))));

        let table: toml::Value = toml::from_str("text = \"a < b\"").unwrap();
        plugin
            .on_load(&LoadContext::new("footer", "mx", Some(table)))
            .await
            .unwrap();
        assert_eq!(plugin.html, "<p>a &lt; b</p>");
    }
}
