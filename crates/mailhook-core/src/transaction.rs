//! Transaction
//!
//! State of one inbound message attempt: envelope, headers, MIME body and
//! the notes map plugins use to hand facts to later hooks.

use chrono::{DateTime, Utc};
use mailhook_common::types::{EmailAddress, HookName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

use crate::headers::HeaderStore;
use crate::mime::{split_header_block, Part};

/// Transaction state errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Envelope is closed, {0} can no longer change")]
    EnvelopeClosed(&'static str),
    #[error("Transaction has a null reverse-path")]
    NullSender,
    #[error("Message data already received")]
    DataAlreadyReceived,
    #[error("Note {key} could not be read: {message}")]
    Note { key: String, message: String },
}

/// Lifecycle phase of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// MAIL FROM accepted, recipients being collected
    Envelope,
    /// Message data received, headers and body populated
    Data,
    /// Queued or rejected
    Complete,
}

/// Handler currently running against a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveHandler {
    pub hook: HookName,
    pub index: usize,
    pub plugin: String,
}

/// One inbound message attempt
#[derive(Debug, Clone)]
pub struct Transaction {
    id: Uuid,
    created_at: DateTime<Utc>,
    phase: Phase,
    /// Address of the connecting client
    pub client_ip: Option<IpAddr>,
    /// HELO/EHLO name given by the client
    pub helo: Option<String>,
    mail_from: Option<EmailAddress>,
    recipients: Vec<EmailAddress>,
    /// Top-level message headers
    pub headers: HeaderStore,
    /// Root MIME part
    pub body: Part,
    notes: HashMap<String, serde_json::Value>,
    active: Option<ActiveHandler>,
}

impl Transaction {
    /// Start a transaction once MAIL FROM is accepted. `None` is the null sender `<>`.
    pub fn new(mail_from: Option<EmailAddress>) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            phase: Phase::Envelope,
            client_ip: None,
            helo: None,
            mail_from,
            recipients: Vec::new(),
            headers: HeaderStore::new(),
            body: Part::default(),
            notes: HashMap::new(),
            active: None,
        }
    }

    /// Attach connection details
    pub fn with_client(mut self, client_ip: Option<IpAddr>, helo: Option<String>) -> Self {
        self.client_ip = client_ip;
        self.helo = helo;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Envelope sender, `None` for the null reverse-path
    pub fn mail_from(&self) -> Option<&EmailAddress> {
        self.mail_from.as_ref()
    }

    /// Mutable envelope sender, only while the envelope is open
    pub fn mail_from_mut(&mut self) -> Result<&mut EmailAddress, TransactionError> {
        if self.phase != Phase::Envelope {
            return Err(TransactionError::EnvelopeClosed("sender"));
        }
        self.mail_from.as_mut().ok_or(TransactionError::NullSender)
    }

    /// Replace the envelope sender, only while the envelope is open
    pub fn set_mail_from(&mut self, sender: Option<EmailAddress>) -> Result<(), TransactionError> {
        if self.phase != Phase::Envelope {
            return Err(TransactionError::EnvelopeClosed("sender"));
        }
        self.mail_from = sender;
        Ok(())
    }

    pub fn recipients(&self) -> &[EmailAddress] {
        &self.recipients
    }

    /// Append a recipient during the envelope phase
    pub fn add_recipient(&mut self, rcpt: EmailAddress) -> Result<(), TransactionError> {
        if self.phase != Phase::Envelope {
            return Err(TransactionError::EnvelopeClosed("recipients"));
        }
        self.recipients.push(rcpt);
        Ok(())
    }

    /// Populate headers and body from the DATA payload
    pub fn set_message(&mut self, raw: &[u8]) -> Result<(), TransactionError> {
        if self.phase != Phase::Envelope {
            return Err(TransactionError::DataAlreadyReceived);
        }

        let (header_block, body) = split_header_block(raw);
        self.headers = HeaderStore::parse(header_block);
        self.body = Part::parse_root(&self.headers, body);
        self.phase = Phase::Data;
        Ok(())
    }

    /// Serialize the full message: headers, blank line, body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        self.body.write_body(&mut out);
        out
    }

    pub(crate) fn complete(&mut self) {
        self.phase = Phase::Complete;
    }

    /// Store a note, replacing any previous value for the key
    pub fn set_note(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.notes.insert(key.into(), value.into());
    }

    /// Store any serializable value as a note
    pub fn set_note_as<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), TransactionError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| TransactionError::Note {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.notes.insert(key, value);
        Ok(())
    }

    pub fn note(&self, key: &str) -> Option<&serde_json::Value> {
        self.notes.get(key)
    }

    /// Read a note as a typed value. `Ok(None)` when the key is absent.
    pub fn note_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, TransactionError> {
        match self.notes.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| TransactionError::Note {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    pub fn remove_note(&mut self, key: &str) -> Option<serde_json::Value> {
        self.notes.remove(key)
    }

    pub fn notes(&self) -> &HashMap<String, serde_json::Value> {
        &self.notes
    }

    /// Handler currently running against this transaction, if any
    pub fn current_handler(&self) -> Option<&ActiveHandler> {
        self.active.as_ref()
    }

    pub(crate) fn set_current_handler(&mut self, active: Option<ActiveHandler>) {
        self.active = active;
    }
}
