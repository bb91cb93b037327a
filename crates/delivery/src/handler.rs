/*
 * Petrel mail delivery agent
 *
 * Copyright (C) 2003 - viridIT SAS
 * Licensed under the Elastic License 2.0
 *
 * You should have received a copy of the Elastic License 2.0 along with
 * this program. If not, see https://www.elastic.co/licensing/elastic-license.
 *
 */

use crate::session::Session;
use petrel_common::outcome::Disposition;
use petrel_common::transfer_error::{Content, NotifyClass, Transfer, Transport};
use petrel_common::Recipient;
use petrel_protocol::auth::Credentials;
use petrel_protocol::Reply;

/// One record of message content, as a queue stores it.
///
/// A record bounded by the queue's own record length carries at most one
/// line; a line longer than that is stored as a run of records with
/// [`BodyRecord::continues`] set on all but the last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyRecord {
    /// The line goes on in the next record, so these bytes must be sent
    /// without a terminator.
    pub continues: bool,
    pub bytes: bytes::Bytes,
}

/// Wire access granted to the `AUTH` callback, scoped to the challenge
/// exchange: command lines out, replies in, nothing else.
pub struct AuthExchange<'a> {
    session: &'a mut Session,
    timeout: std::time::Duration,
}

impl<'a> AuthExchange<'a> {
    pub(crate) fn new(session: &'a mut Session, timeout: std::time::Duration) -> Self {
        Self { session, timeout }
    }

    /// Send one command line, terminator appended. The line is kept out of
    /// the transcript, credentials have no business in postmaster copies.
    ///
    /// # Errors
    ///
    /// * the peer went away or the write failed
    pub async fn send_line(&mut self, line: &str) -> Result<(), Transfer> {
        self.session
            .write_sensitive(&format!("{line}\r\n"))
            .await
            .map_err(|error| Transport::from_io(&error, "sending AUTH"))?;
        self.session
            .flush()
            .await
            .map_err(|error| Transport::from_io(&error, "sending AUTH"))?;
        Ok(())
    }

    /// Wait for the next server reply.
    ///
    /// # Errors
    ///
    /// * the reply did not arrive in time, or the read failed
    pub async fn read_reply(&mut self) -> Result<Reply, Transfer> {
        match tokio::time::timeout(self.timeout, self.session.read_reply()).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(error)) => Err(Transport::from_io(&error, "reading AUTH reply").into()),
            Err(_elapsed) => Err(Transport::Timeout {
                during: "reading AUTH reply".to_owned(),
            }
            .into()),
        }
    }
}

/// What a delivery needs from its caller: the message content, a sink for
/// per-recipient results, and the optional protocol callbacks.
///
/// The handler outlives the attempt, so results accumulated through
/// [`DeliveryHandler::on_disposition`] stay available after
/// [`crate::send::SmtpClient::deliver`] returns.
#[async_trait::async_trait]
pub trait DeliveryHandler: Send {
    /// Reposition the content source at the first record. Called before each
    /// time the body is streamed, including retries on another server.
    async fn rewind_body(&mut self) -> std::io::Result<()>;

    /// Next content record, `None` once the message is exhausted.
    async fn next_body_record(&mut self) -> std::io::Result<Option<BodyRecord>>;

    /// Rewrite one record before it is encoded for the wire. Returning
    /// `Ok(None)` drops the record; an error abandons the message for every
    /// recipient, at this server and everywhere else.
    fn transform_record(&mut self, record: BodyRecord) -> Result<Option<BodyRecord>, Content> {
        Ok(Some(record))
    }

    /// A recipient just reached a terminal disposition. Called exactly once
    /// per recipient, in the order the decisions fall.
    async fn on_disposition(&mut self, recipient: &Recipient, disposition: &Disposition);

    /// A transcript of a failed session, for the postmaster. Only called for
    /// the failure classes the configuration asks copies for.
    async fn on_postmaster_copy(&mut self, _class: NotifyClass, _summary: &str, _transcript: &str) {
    }

    /// Authenticate against a server which offers `AUTH`. Only called when
    /// credentials are configured; `mechanisms` is the parameter list the
    /// server announced. The default refuses to send anything.
    ///
    /// # Errors
    ///
    /// * the implementation could not complete the exchange
    async fn authenticate(
        &mut self,
        _mechanisms: &str,
        _credentials: &Credentials,
        _exchange: AuthExchange<'_>,
    ) -> Result<(), Transfer> {
        Err(Transport::Io {
            message: "server expects AUTH but no authenticator is configured".to_owned(),
        }
        .into())
    }
}

/// Message content held in memory, split into records the way a queue file
/// stores it. Building block for handlers whose content is already buffered.
#[derive(Debug, Clone)]
pub struct BufferedBody {
    records: Vec<BodyRecord>,
    cursor: usize,
}

impl BufferedBody {
    /// Split at line boundaries, terminators dropped.
    #[must_use]
    pub fn new(message: &[u8]) -> Self {
        Self::build(message, usize::MAX)
    }

    /// Same, but lines longer than `record_size` become a run of
    /// continuation records, matching queues that bound their record length.
    #[must_use]
    pub fn with_record_size(message: &[u8], record_size: usize) -> Self {
        Self::build(message, record_size.max(1))
    }

    fn build(message: &[u8], record_size: usize) -> Self {
        let mut records = vec![];

        if !message.is_empty() {
            for raw in message.split(|byte| *byte == b'\n') {
                let mut line = raw.strip_suffix(b"\r").unwrap_or(raw);
                while line.len() > record_size {
                    let (chunk, tail) = line.split_at(record_size);
                    records.push(BodyRecord {
                        continues: true,
                        bytes: bytes::Bytes::copy_from_slice(chunk),
                    });
                    line = tail;
                }
                records.push(BodyRecord {
                    continues: false,
                    bytes: bytes::Bytes::copy_from_slice(line),
                });
            }

            // a trailing newline is a terminator, not an empty last line.
            if message.last() == Some(&b'\n') {
                records.pop();
            }
        }

        Self { records, cursor: 0 }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn next_record(&mut self) -> Option<BodyRecord> {
        let record = self.records.get(self.cursor).cloned();
        self.cursor += usize::from(record.is_some());
        record
    }
}
