//! Built-in plugins loaded from configuration and driven through a session

use mailhook_common::config::Config;
use mailhook_common::types::{EmailAddress, Reply};
use mailhook_core::plugins::{ORIGINAL_SENDER_NOTE, REVERSED_NOTE, SPAM_SCORE_NOTE};
use mailhook_core::{DataResult, HeaderStore, PluginError, PluginLoader, QueuedMessage, Session};
use mailhook_core::mime::split_header_block;
use pretty_assertions::assert_eq;
use std::sync::Arc;

const CONFIG: &str = r#"
[server]
hostname = "mx.example.org"

[pipeline]
plugins = ["srs", "attachment_filter", "footer", "message_id", "spam_score", "received"]

[plugins.srs]
local_domains = ["example.org"]

[plugins.footer]
text = "Scanned by mx.example.org"
"#;

const MESSAGE: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: bob@example.org\r\n\
Date: Mon, 1 Jan 2024 09:00:00 +0000\r\n\
Subject: Meeting notes\r\n\
\r\n\
Notes from this morning are below.\r\n";

async fn session() -> Session {
    let config = Config::from_toml(CONFIG).unwrap();
    let pipeline = PluginLoader::with_builtins()
        .with_env(|key| (key == "MAILHOOK_SRS_SECRET").then(|| "s3cret".to_string()))
        .load(&config)
        .await
        .unwrap();

    let mut session = Session::new(Arc::new(pipeline), Some("192.0.2.7".parse().unwrap()));
    session.helo("client.example.com");
    session
}

fn queued(result: DataResult) -> QueuedMessage {
    match result {
        DataResult::Queued(message) => message,
        DataResult::Rejected(reply) => panic!("message rejected: {}", reply),
    }
}

fn headers(data: &[u8]) -> HeaderStore {
    HeaderStore::parse(split_header_block(data).0)
}

#[tokio::test]
async fn accepted_message_carries_every_plugin_edit() {
    let mut session = session().await;

    assert_eq!(session.mail_from(EmailAddress::parse("alice@example.com")).await, Reply::ok("2.1.0 OK"));
    assert_eq!(session.rcpt_to(EmailAddress::new("bob", "example.org")).await, Reply::ok("2.1.5 OK"));
    let message = queued(session.data(MESSAGE).await);

    let sender = message.mail_from.clone().unwrap();
    assert!(sender.local.starts_with("SRS0="));
    assert_eq!(sender.domain, "mx.example.org");
    assert_eq!(
        message.notes.get(ORIGINAL_SENDER_NOTE),
        Some(&serde_json::json!("alice@example.com"))
    );
    assert!(message.notes.contains_key(SPAM_SCORE_NOTE));

    let text = String::from_utf8_lossy(&message.data).into_owned();
    assert!(text.starts_with("Received: from client.example.com ([192.0.2.7])\r\n\tby mx.example.org"));
    assert!(text.ends_with("Notes from this morning are below.\r\n\r\n-- \r\nScanned by mx.example.org\r\n"));

    let headers = headers(&message.data);
    assert_eq!(headers.count("Message-ID"), 1);
    assert!(headers.get("Message-ID").ends_with("@mx.example.org>"));
    assert_eq!(headers.count("X-Spam-Status"), 1);
    assert!(headers.get("X-Spam-Status").starts_with("No, "));
    assert_eq!(headers.get("Subject"), "Meeting notes");
}

#[tokio::test]
async fn bounce_to_rewritten_sender_is_reversed() {
    let mut session = session().await;
    session.mail_from(EmailAddress::parse("alice@example.com")).await;
    session.rcpt_to(EmailAddress::new("bob", "example.org")).await;
    let rewritten = queued(session.data(MESSAGE).await).mail_from.unwrap();

    assert_eq!(session.mail_from(None).await, Reply::ok("2.1.0 OK"));
    assert_eq!(session.rcpt_to(rewritten).await, Reply::ok("2.1.5 OK"));
    assert_eq!(
        session.transaction().unwrap().note_as::<String>(REVERSED_NOTE).unwrap(),
        Some("alice@example.com".to_string())
    );

    session.reset();
    session.mail_from(None).await;
    let forged = EmailAddress::new("SRS0=deadbeef=example.com=alice", "mx.example.org");
    assert_eq!(session.rcpt_to(forged).await, Reply::new(550, "5.1.1 Invalid SRS address"));
    assert!(session.transaction().is_none());
}

#[tokio::test]
async fn blocked_attachment_rejects_message() {
    let mut session = session().await;
    session.mail_from(EmailAddress::parse("alice@example.com")).await;
    session.rcpt_to(EmailAddress::new("bob", "example.org")).await;

    let raw = b"Subject: invoice\r\n\
Content-Type: multipart/mixed; boundary=b\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
Please pay.\r\n\
--b\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"invoice.pdf.exe\"\r\n\
\r\n\
TVqQAAMAAAAEAAAA\r\n\
--b--\r\n";

    let result = session.data(raw).await;
    assert_eq!(
        result,
        DataResult::Rejected(Reply::new(554, "5.7.1 Message contains a blocked attachment: invoice.pdf.exe"))
    );
    assert!(session.transaction().is_none());
}

#[tokio::test]
async fn unknown_plugin_is_a_configuration_error() {
    let config = Config::from_toml("[pipeline]\nplugins = [\"message_id\", \"greylist\"]\n").unwrap();
    let err = PluginLoader::with_builtins().load(&config).await.unwrap_err();
    assert!(matches!(err, PluginError::Config(ref message) if message.contains("greylist")));
}

#[tokio::test]
async fn missing_secret_fails_start_up() {
    let config = Config::from_toml("[pipeline]\nplugins = [\"srs\"]\n").unwrap();
    let err = PluginLoader::with_builtins()
        .with_env(|_| None)
        .load(&config)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Secret(_)));
}
