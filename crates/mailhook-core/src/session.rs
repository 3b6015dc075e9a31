//! Session - the boundary between the SMTP engine and the hook pipeline
//!
//! The engine drives a `Session` with one call per accepted command. The
//! session owns at most one live [`Transaction`], fires the matching hook
//! and turns the outcome into the reply the engine writes on the wire.

use chrono::{DateTime, Utc};
use mailhook_common::types::{EmailAddress, HookName, HookOutcome, Reply};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::hooks::HookArgs;
use crate::plugins::Pipeline;
use crate::transaction::{Transaction, TransactionError};

/// Command sequence errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("MAIL FROM before HELO")]
    NoHelo,
    #[error("Sender already specified")]
    NestedMail,
    #[error("No transaction in progress")]
    NoTransaction,
    #[error("No recipients specified")]
    NoRecipients,
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl SessionError {
    /// Reply the engine sends for this error
    pub fn reply(&self) -> Reply {
        match self {
            SessionError::NoRecipients => Reply::new(503, "5.5.1 No recipients specified"),
            SessionError::NestedMail => Reply::new(503, "5.5.1 Sender already specified"),
            SessionError::Transaction(TransactionError::Note { .. }) => {
                Reply::new(451, "4.3.0 Local error in processing")
            }
            _ => Reply::new(503, "5.5.1 Bad sequence of commands"),
        }
    }
}

impl From<SessionError> for Reply {
    fn from(err: SessionError) -> Self {
        err.reply()
    }
}

/// A message that passed every hook, ready for the queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub transaction_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub mail_from: Option<EmailAddress>,
    pub recipients: Vec<EmailAddress>,
    /// Notes left by plugins
    pub notes: HashMap<String, serde_json::Value>,
    /// Full message after plugin edits
    pub data: Vec<u8>,
}

impl QueuedMessage {
    fn from_transaction(txn: Transaction) -> Self {
        Self {
            transaction_id: txn.id(),
            received_at: txn.created_at(),
            mail_from: txn.mail_from().cloned(),
            recipients: txn.recipients().to_vec(),
            data: txn.to_bytes(),
            notes: txn.notes().clone(),
        }
    }

    /// 250 reply naming the queue id
    pub fn reply(&self) -> Reply {
        Reply::ok(format!("2.0.0 OK: queued as {}", self.transaction_id.simple()))
    }
}

/// Result of the DATA phase
#[derive(Debug, Clone, PartialEq)]
pub enum DataResult {
    Queued(QueuedMessage),
    Rejected(Reply),
}

impl DataResult {
    pub fn reply(&self) -> Reply {
        match self {
            DataResult::Queued(message) => message.reply(),
            DataResult::Rejected(reply) => reply.clone(),
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, DataResult::Queued(_))
    }
}

/// One client connection's view of the pipeline
pub struct Session {
    pipeline: Arc<Pipeline>,
    peer: Option<IpAddr>,
    helo: Option<String>,
    transaction: Option<Transaction>,
}

impl Session {
    pub fn new(pipeline: Arc<Pipeline>, peer: Option<IpAddr>) -> Self {
        Self {
            pipeline,
            peer,
            helo: None,
            transaction: None,
        }
    }

    pub fn peer(&self) -> Option<IpAddr> {
        self.peer
    }

    /// Live transaction, if MAIL FROM was accepted
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// HELO/EHLO. Starts over, discarding any live transaction.
    pub fn helo(&mut self, name: impl Into<String>) -> Reply {
        let name = name.into();
        debug!(helo = %name, "Client greeted");
        self.helo = Some(name);
        self.transaction = None;
        Reply::ok("OK")
    }

    /// MAIL FROM. `None` is the null reverse-path.
    pub async fn mail_from(&mut self, sender: Option<EmailAddress>) -> Reply {
        match self.try_mail_from(sender).await {
            Ok(reply) => reply,
            Err(e) => e.reply(),
        }
    }

    async fn try_mail_from(&mut self, sender: Option<EmailAddress>) -> Result<Reply, SessionError> {
        if self.helo.is_none() {
            return Err(SessionError::NoHelo);
        }
        if self.transaction.is_some() {
            return Err(SessionError::NestedMail);
        }

        let mut txn = Transaction::new(sender).with_client(self.peer, self.helo.clone());
        let report = self
            .pipeline
            .dispatch(HookName::EnvelopeFrom, &mut txn, &HookArgs::none())
            .await;

        if let HookOutcome::Deny(reply) = report.outcome {
            info!(transaction_id = %txn.id(), reply = %reply, "Sender denied");
            return Ok(reply);
        }

        self.transaction = Some(txn);
        Ok(Reply::ok("2.1.0 OK"))
    }

    /// RCPT TO, once per recipient. A DENY discards the whole transaction.
    pub async fn rcpt_to(&mut self, rcpt: EmailAddress) -> Reply {
        match self.try_rcpt_to(rcpt).await {
            Ok(reply) => reply,
            Err(e) => e.reply(),
        }
    }

    async fn try_rcpt_to(&mut self, rcpt: EmailAddress) -> Result<Reply, SessionError> {
        let txn = self.transaction.as_mut().ok_or(SessionError::NoTransaction)?;

        let report = self
            .pipeline
            .dispatch(HookName::EnvelopeTo, txn, &HookArgs::recipient(rcpt.clone()))
            .await;

        if let HookOutcome::Deny(reply) = report.outcome {
            info!(transaction_id = %txn.id(), recipient = %rcpt, reply = %reply, "Recipient denied, discarding transaction");
            self.transaction = None;
            return Ok(reply);
        }

        txn.add_recipient(rcpt)?;
        Ok(Reply::ok("2.1.5 OK"))
    }

    /// DATA payload, dot-unstuffed, without the terminating `.` line.
    ///
    /// The transaction ends here whatever the outcome.
    pub async fn data(&mut self, raw: &[u8]) -> DataResult {
        match self.try_data(raw).await {
            Ok(result) => result,
            Err(e) => DataResult::Rejected(e.reply()),
        }
    }

    async fn try_data(&mut self, raw: &[u8]) -> Result<DataResult, SessionError> {
        match &self.transaction {
            None => return Err(SessionError::NoTransaction),
            Some(txn) if txn.recipients().is_empty() => return Err(SessionError::NoRecipients),
            Some(_) => {}
        }
        let mut txn = self.transaction.take().ok_or(SessionError::NoTransaction)?;

        txn.set_message(raw)?;
        let report = self
            .pipeline
            .dispatch(HookName::BodyComplete, &mut txn, &HookArgs::none())
            .await;
        txn.complete();

        if let HookOutcome::Deny(reply) = report.outcome {
            info!(transaction_id = %txn.id(), reply = %reply, "Message denied");
            return Ok(DataResult::Rejected(reply));
        }

        let message = QueuedMessage::from_transaction(txn);
        info!(
            transaction_id = %message.transaction_id,
            recipients = message.recipients.len(),
            size = message.data.len(),
            "Message accepted"
        );
        Ok(DataResult::Queued(message))
    }

    /// RSET. Discards the live transaction, keeps the greeting.
    pub fn reset(&mut self) -> Reply {
        self.transaction = None;
        Reply::ok("2.0.0 OK")
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("helo", &self.helo)
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .finish()
    }
}
