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

//! The command side of a delivery attempt.
//!
//! One [`Engine`] runs one mail transaction over an established session. Two
//! cursors walk [`ProtocolState`]: `send_state` is the command about to be
//! emitted, `recv_state` the reply being consumed. With pipelining the sender
//! runs ahead until the tracked server buffer fills up or a synchronization
//! point is reached; without it every command waits for its answer.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::DeliveryConfig;
use crate::handler::{BodyRecord, DeliveryHandler};
use crate::session::Session;
use petrel_common::extensions::Extension;
use petrel_common::outcome::{RecipientState, Verdict};
use petrel_common::request::DeliveryRequest;
use petrel_common::transfer_error::{ErrorClass, Protocol, Transfer, Transport};
use petrel_protocol::command;
use petrel_protocol::{BodyEncoder, MailParams, ProtocolState, Reply, Severity};

/// How the session reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEntry {
    /// Fresh connection, greeting and hello are done.
    Fresh,
    /// Pulled out of the cache, must prove it is still alive first.
    Reused,
}

/// One reply the server still owes us, in command order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    XfwdNameAddr,
    XfwdProtoHelo,
    Mail,
    /// `RCPT TO` for the recipient at this index.
    Rcpt(usize),
    Data,
    /// End of data, one reply for the whole message.
    DotSmtp,
    /// End of data, this reply settles the recipient at this index.
    DotLmtp(usize),
    Abort,
    Quit,
}

impl Step {
    const fn state(self) -> ProtocolState {
        match self {
            Self::XfwdNameAddr => ProtocolState::XfwdNameAddr,
            Self::XfwdProtoHelo => ProtocolState::XfwdProtoHelo,
            Self::Mail => ProtocolState::Mail,
            Self::Rcpt(_) => ProtocolState::Rcpt,
            Self::Data => ProtocolState::Data,
            Self::DotSmtp | Self::DotLmtp(_) => ProtocolState::Dot,
            Self::Abort => ProtocolState::Abort,
            Self::Quit => ProtocolState::Quit,
        }
    }
}

/// Replies can never run ahead of commands.
fn cursors_ordered(recv: ProtocolState, send: ProtocolState) -> bool {
    recv <= send
}

fn rejection(request: &str, reply: &Reply) -> Transfer {
    Protocol::ServerReject {
        request: request.to_owned(),
        reply: reply.clone(),
    }
    .into()
}

/// Runs one transaction and records a fate for the recipients it settles.
///
/// Recipients the engine does not get around to deciding, because the
/// session died under it, stay unmarked for the caller to try elsewhere.
pub(crate) struct Engine<'a, H> {
    config: &'a DeliveryConfig,
    session: &'a mut Session,
    handler: &'a mut H,
    request: &'a DeliveryRequest,
    recipients: &'a mut [RecipientState],
    /// The caller would take the session back afterwards.
    may_cache: bool,
    /// Forwarded attribute commands, two batches, built once up front.
    xfwd: (Option<String>, Option<String>),
    send_state: ProtocolState,
    recv_state: ProtocolState,
    /// Next recipient to build a `RCPT TO` for.
    send_rcpt: usize,
    /// Replies owed by the server for commands already buffered or sent.
    plan: VecDeque<Step>,
    /// Commands waiting to go out in one write.
    batch: String,
    /// Full send window; zero when the server did not offer pipelining.
    budget: usize,
    /// What is left of the window until the receiver catches up.
    space_left: usize,
    last_io: Instant,
    /// `MAIL FROM` was refused, replies to its recipients mean nothing.
    mail_rejected: bool,
    /// Recipient indexes the server accepted, in `RCPT TO` order.
    accepted: Vec<usize>,
    /// `DATA` was refused, the terminator must not follow.
    data_refused: bool,
}

impl<'a, H: DeliveryHandler> Engine<'a, H> {
    pub(crate) fn new(
        config: &'a DeliveryConfig,
        session: &'a mut Session,
        handler: &'a mut H,
        request: &'a DeliveryRequest,
        recipients: &'a mut [RecipientState],
        may_cache: bool,
    ) -> Self {
        let ehlo = session.ehlo();
        let budget = if ehlo.contains(Extension::Pipelining) {
            config.send_buffer_size
        } else {
            0
        };
        let xfwd = if config.send_xforward && ehlo.contains(Extension::Xforward) {
            let attrs = ehlo.xforward_attrs();
            (
                command::xforward_name_addr(&request.xforward, attrs),
                command::xforward_proto_helo(&request.xforward, attrs),
            )
        } else {
            (None, None)
        };
        let send_state = if xfwd.0.is_some() || xfwd.1.is_some() {
            ProtocolState::XfwdNameAddr
        } else {
            ProtocolState::Mail
        };

        Self {
            config,
            session,
            handler,
            request,
            recipients,
            may_cache,
            xfwd,
            send_state,
            recv_state: send_state,
            send_rcpt: 0,
            plan: VecDeque::new(),
            batch: String::new(),
            budget,
            space_left: budget,
            last_io: Instant::now(),
            mail_rejected: false,
            accepted: vec![],
            data_refused: false,
        }
    }

    /// Run the transaction to completion.
    ///
    /// # Errors
    ///
    /// * [`Transfer`] when the session became unusable before the
    ///   transaction wound down; dispositions recorded up to that point
    ///   stand
    pub(crate) async fn run(mut self, entry: SessionEntry) -> Result<(), Transfer> {
        if entry == SessionEntry::Reused {
            self.probe().await?;
        }

        while self.send_state != ProtocolState::Last {
            // drain before emitting: at a synchronization point always, and
            // whenever the conversation sat idle long enough that holding
            // replies back buys nothing anymore
            if !self.plan.is_empty()
                && (self.send_state.is_sync_point()
                    || self.last_io.elapsed() >= self.config.pipeline_stall_limit)
            {
                self.drain().await?;
                self.course_correct();
                continue;
            }

            match self.send_state {
                ProtocolState::XfwdNameAddr => {
                    if let Some(xfwd) = self.xfwd.0.clone() {
                        if self.buffer_command(&xfwd, Some(Step::XfwdNameAddr)).await? {
                            self.send_state = ProtocolState::XfwdProtoHelo;
                        }
                    } else {
                        self.send_state = ProtocolState::XfwdProtoHelo;
                    }
                }
                ProtocolState::XfwdProtoHelo => {
                    if let Some(xfwd) = self.xfwd.1.clone() {
                        if self.buffer_command(&xfwd, Some(Step::XfwdProtoHelo)).await? {
                            self.send_state = ProtocolState::Mail;
                        }
                    } else {
                        self.send_state = ProtocolState::Mail;
                    }
                }
                ProtocolState::Mail => self.buffer_mail().await?,
                ProtocolState::Rcpt => self.buffer_rcpt().await?,
                ProtocolState::Data => {
                    if self.buffer_command(command::DATA, Some(Step::Data)).await? {
                        self.send_state = ProtocolState::Dot;
                    }
                }
                ProtocolState::Dot => self.send_dot().await?,
                ProtocolState::Abort | ProtocolState::Rset => self.buffer_abort().await?,
                ProtocolState::Quit => self.buffer_quit().await?,
                ProtocolState::Last => break,
            }
        }

        // the quit may still sit in the batch, the dot replies in the plan
        self.drain().await
    }

    /// Make sure a cached session still answers before loading it up.
    async fn probe(&mut self) -> Result<(), Transfer> {
        let state = ProtocolState::Rset;
        self.session
            .write_all(command::RSET)
            .await
            .map_err(|error| Transport::from_io(&error, state.label()))?;
        self.session
            .flush()
            .await
            .map_err(|error| Transport::from_io(&error, state.label()))?;

        let reply = self.timed_reply(state).await?;
        if reply.severity() != Severity::PositiveCompletion {
            return Err(rejection(state.request(), &reply));
        }
        Ok(())
    }

    /// Append one command to the outgoing batch, unless the window says the
    /// receiver must catch up first. Returns whether the command was taken;
    /// when it was not, the drain may have changed the engine's plans and
    /// the caller has to rebuild from the current state.
    async fn buffer_command(&mut self, command: &str, step: Option<Step>) -> Result<bool, Transfer> {
        if !self.plan.is_empty() && command.len() > self.space_left {
            self.drain().await?;
            self.course_correct();
            return Ok(false);
        }
        self.session.note_command(command);
        self.batch.push_str(command);
        self.space_left = self.space_left.saturating_sub(command.len());
        if let Some(step) = step {
            self.plan.push_back(step);
        }
        Ok(true)
    }

    async fn buffer_mail(&mut self) -> Result<(), Transfer> {
        let mail = command::mail_from(
            self.request.reverse_path.as_ref().map(|mailbox| &mailbox.0),
            &self.mail_params(),
        );
        if self.buffer_command(&mail, Some(Step::Mail)).await? {
            self.send_state = ProtocolState::Rcpt;
        }
        Ok(())
    }

    /// Optional `MAIL FROM` parameters, each gated on the server offering
    /// the extension that defines it.
    fn mail_params(&self) -> MailParams {
        let ehlo = self.session.ehlo();
        let dsn = ehlo.contains(Extension::DeliveryStatusNotification);
        MailParams {
            size: (ehlo.contains(Extension::Size) && self.request.size_estimate > 0)
                .then_some(self.request.size_estimate),
            body: ehlo
                .contains(Extension::BitMime8)
                .then_some(self.request.body_type)
                .flatten(),
            envelop_id: dsn.then(|| self.request.envelop_id.clone()).flatten(),
            ret: dsn.then_some(self.request.ret).flatten(),
        }
    }

    async fn buffer_rcpt(&mut self) -> Result<(), Transfer> {
        if self.send_rcpt >= self.recipients.len() {
            self.send_state = ProtocolState::Data;
            return Ok(());
        }
        let index = self.send_rcpt;
        let rcpt = {
            let dsn = self
                .session
                .ehlo()
                .contains(Extension::DeliveryStatusNotification);
            let recipient = self.recipients[index].recipient();
            let (original, notify) = if dsn {
                (
                    recipient.original_forward_path.as_ref(),
                    Some(&recipient.notify_on),
                )
            } else {
                (None, None)
            };
            command::rcpt_to(&recipient.forward_path.0, original, notify)
        };
        if self.buffer_command(&rcpt, Some(Step::Rcpt(index))).await? {
            self.send_rcpt += 1;
            if self.send_rcpt == self.recipients.len() {
                self.send_state = ProtocolState::Data;
            }
        }
        Ok(())
    }

    /// Stream the message and its terminator. Reaching this state is a
    /// synchronization point, so every earlier reply has been consumed and
    /// `accepted` is final.
    async fn send_dot(&mut self) -> Result<(), Transfer> {
        debug_assert!(self.plan.is_empty() && self.batch.is_empty());

        let keep_open = self.decide_keep_open();
        self.session.set_keep_open(keep_open);

        if self.accepted.is_empty() {
            // every recipient was refused but the server granted DATA
            // anyway; a lone terminator closes the transaction it is now
            // waiting on (RFC 2920 section 3.1)
            self.session.note_command(".");
            self.session
                .write_all_bytes(b".\r\n")
                .await
                .map_err(|error| Transport::from_io(&error, ProtocolState::Dot.label()))?;
            self.session
                .flush()
                .await
                .map_err(|error| Transport::from_io(&error, ProtocolState::Dot.label()))?;
            self.last_io = Instant::now();
            // LMTP answers the terminator once per accepted recipient,
            // which here means not at all (RFC 2033 section 4.2)
            if !self.config.protocol.is_lmtp() {
                self.plan.push_back(Step::DotSmtp);
            }
        } else {
            self.stream_body().await?;
            if self.config.protocol.is_lmtp() {
                for index in self.accepted.clone() {
                    self.plan.push_back(Step::DotLmtp(index));
                }
            } else {
                self.plan.push_back(Step::DotSmtp);
            }
        }

        self.send_state = if keep_open {
            ProtocolState::Last
        } else {
            ProtocolState::Quit
        };
        Ok(())
    }

    async fn buffer_abort(&mut self) -> Result<(), Transfer> {
        if self.buffer_command(command::RSET, Some(Step::Abort)).await? {
            let keep_open = self.decide_keep_open();
            self.session.set_keep_open(keep_open);
            self.send_state = if keep_open {
                ProtocolState::Last
            } else {
                ProtocolState::Quit
            };
        }
        Ok(())
    }

    async fn buffer_quit(&mut self) -> Result<(), Transfer> {
        let step = (!self.config.skip_quit_response).then_some(Step::Quit);
        if self.buffer_command(command::QUIT, step).await? {
            self.send_state = ProtocolState::Last;
        }
        Ok(())
    }

    /// Whether the session is worth keeping once the transaction is over.
    /// Settled while building its final command and never revisited, a
    /// timer expiring later must not flip the wind-down path.
    fn decide_keep_open(&self) -> bool {
        self.may_cache
            && !self.session.is_bad()
            && self.session.deliveries() + 1 < self.config.session_reuse_limit
    }

    /// Send the batch and consume every reply the server owes, then open
    /// the send window back up.
    async fn drain(&mut self) -> Result<(), Transfer> {
        self.flush_batch().await?;
        while let Some(step) = self.plan.front().copied() {
            self.recv_state = step.state();
            debug_assert!(cursors_ordered(self.recv_state, self.send_state));
            let reply = self.timed_reply(step.state()).await?;
            self.plan.pop_front();
            tracing::trace!(state = %step.state(), code = reply.code().value(), "reply");
            self.process_reply(step, reply).await?;
        }
        self.space_left = self.budget;
        Ok(())
    }

    async fn flush_batch(&mut self) -> Result<(), Transfer> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let during = self
            .plan
            .back()
            .map_or(self.send_state, |step| step.state())
            .label();
        let batch = std::mem::take(&mut self.batch);
        self.session
            .write_all_bytes(batch.as_bytes())
            .await
            .map_err(|error| Transport::from_io(&error, during))?;
        self.session
            .flush()
            .await
            .map_err(|error| Transport::from_io(&error, during))?;
        self.last_io = Instant::now();
        tracing::trace!(bytes = batch.len(), "sent command batch");
        Ok(())
    }

    /// One reply, bounded by the per-state timer, protocol damage noted.
    async fn timed_reply(&mut self, state: ProtocolState) -> Result<Reply, Transfer> {
        let reply = match tokio::time::timeout(
            self.config.timeouts.for_state(state),
            self.session.read_reply(),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => return Err(Transport::from_io(&error, state.label()).into()),
            Err(_elapsed) => {
                return Err(Transport::Timeout {
                    during: state.label().to_owned(),
                }
                .into())
            }
        };
        self.last_io = Instant::now();
        if reply.is_protocol_error() {
            self.session.mark_bad();
        }
        Ok(reply)
    }

    /// A drain may reveal that the transaction died behind commands planned
    /// optimistically; following through with them is pointless. Nothing
    /// already sent is retracted and no recorded disposition changes, the
    /// transaction just winds down early.
    fn course_correct(&mut self) {
        let dead = match self.send_state {
            ProtocolState::Rcpt => self.mail_rejected,
            ProtocolState::Data => self.accepted.is_empty(),
            ProtocolState::Dot => self.data_refused,
            _ => false,
        };
        if dead {
            debug_assert!(self.plan.is_empty());
            tracing::debug!(state = %self.send_state, "transaction is dead, skipping to RSET");
            self.send_state = ProtocolState::Abort;
            self.recv_state = ProtocolState::Abort;
        }
    }

    async fn process_reply(&mut self, step: Step, reply: Reply) -> Result<(), Transfer> {
        match step {
            Step::XfwdNameAddr | Step::XfwdProtoHelo => {
                if reply.severity() != Severity::PositiveCompletion {
                    return Err(rejection(step.state().request(), &reply));
                }
            }
            Step::Mail => {
                if reply.severity() != Severity::PositiveCompletion {
                    self.mail_rejected = true;
                    let error = rejection(ProtocolState::Mail.request(), &reply);
                    for index in 0..self.recipients.len() {
                        self.record_error(index, &error).await;
                    }
                }
            }
            Step::Rcpt(index) => {
                // replies to recipients of a rejected MAIL mean nothing
                if self.mail_rejected {
                    return Ok(());
                }
                if reply.severity() == Severity::PositiveCompletion {
                    self.accepted.push(index);
                } else {
                    let error = rejection(ProtocolState::Rcpt.request(), &reply);
                    self.record_error(index, &error).await;
                }
            }
            Step::Data => {
                if reply.severity() != Severity::PositiveIntermediate {
                    self.data_refused = true;
                    let error = rejection(ProtocolState::Data.request(), &reply);
                    self.record_error_accepted(&error).await;
                }
            }
            Step::DotSmtp => {
                if reply.severity() == Severity::PositiveCompletion {
                    let verdict = Verdict::delivered(&reply);
                    for index in self.accepted.clone() {
                        // delivered mail leaves the queue
                        self.record(index, false, verdict.clone()).await;
                    }
                } else {
                    let error = rejection(ProtocolState::Dot.request(), &reply);
                    self.record_error_accepted(&error).await;
                }
            }
            Step::DotLmtp(index) => {
                if reply.severity() == Severity::PositiveCompletion {
                    self.record(index, false, Verdict::delivered(&reply)).await;
                } else {
                    let error = rejection(ProtocolState::Dot.request(), &reply);
                    self.record_error(index, &error).await;
                }
            }
            Step::Abort => {
                // a server that cannot reset is not safe to reuse
                if reply.severity() != Severity::PositiveCompletion {
                    self.session.mark_bad();
                }
            }
            Step::Quit => {}
        }
        Ok(())
    }

    /// Stream the message records through the dot-stuffing encoder, the
    /// terminator last.
    async fn stream_body(&mut self) -> Result<(), Transfer> {
        self.handler
            .rewind_body()
            .await
            .map_err(|error| Transport::Io {
                message: format!("reading the message body: {error}"),
            })?;

        let mut encoder = BodyEncoder::new(self.config.line_length_limit);
        let mut chunk = Vec::with_capacity(self.config.send_buffer_size.max(1024));

        loop {
            let Some(record) = self
                .handler
                .next_body_record()
                .await
                .map_err(|error| Transport::Io {
                    message: format!("reading the message body: {error}"),
                })?
            else {
                break;
            };
            let Some(record) = self.transform(record).await? else {
                continue;
            };
            encoder.record(record.continues, &record.bytes, &mut chunk);
            if chunk.len() >= self.config.send_buffer_size {
                self.write_body_chunk(&chunk).await?;
                chunk.clear();
            }
        }

        encoder.finish(&mut chunk);
        chunk.extend_from_slice(b".\r\n");
        self.session.note_command(".");
        self.write_body_chunk(&chunk).await?;
        if let Err(error) = self.session.flush().await {
            return Err(self.salvage_rejection(&error).await);
        }
        self.last_io = Instant::now();
        Ok(())
    }

    /// One record through the caller's transforms. A transform refusing the
    /// message is final for every recipient, there is no other server to
    /// try.
    async fn transform(&mut self, record: BodyRecord) -> Result<Option<BodyRecord>, Transfer> {
        match self.handler.transform_record(record) {
            Ok(next) => Ok(next),
            Err(error) => {
                let error = Transfer::from(error);
                let verdict = Verdict::from_transfer(&error);
                for index in 0..self.recipients.len() {
                    self.record(index, false, verdict.clone()).await;
                }
                Err(error)
            }
        }
    }

    async fn write_body_chunk(&mut self, chunk: &[u8]) -> Result<(), Transfer> {
        let written = tokio::time::timeout(
            self.config.timeouts.data_block,
            self.session.write_all_bytes(chunk),
        )
        .await;
        match written {
            Ok(Ok(())) => {
                self.last_io = Instant::now();
                Ok(())
            }
            Ok(Err(error)) => Err(self.salvage_rejection(&error).await),
            Err(_elapsed) => {
                let error = std::io::Error::from(std::io::ErrorKind::TimedOut);
                Err(self.salvage_rejection(&error).await)
            }
        }
    }

    /// The peer may have rejected the message and hung up before we were
    /// done sending it. One last read can still find that rejection
    /// buffered ahead of the disconnect, which settles the recipients
    /// instead of sending the whole message again later.
    async fn salvage_rejection(&mut self, cause: &std::io::Error) -> Transfer {
        let fallback: Transfer = match cause.kind() {
            std::io::ErrorKind::TimedOut => Transport::Timeout {
                during: "sending message body".to_owned(),
            },
            _ => Transport::LostBody,
        }
        .into();

        match tokio::time::timeout(self.config.timeouts.data_done, self.session.read_reply()).await
        {
            Ok(Ok(reply)) if reply.is_error() => {
                let error = rejection("message body", &reply);
                self.record_error_accepted(&error).await;
                error
            }
            _ => fallback,
        }
    }

    /// Apply `verdict` to one recipient unless its fate is already decided;
    /// `keep` leaves it queued for another attempt, otherwise it is done
    /// with, delivered or bounced.
    async fn record(&mut self, index: usize, keep: bool, verdict: Verdict) {
        let state = &mut self.recipients[index];
        let recorded = if keep {
            state.mark_keep(verdict)
        } else {
            state.mark_drop(verdict)
        };
        if recorded {
            let state = &self.recipients[index];
            self.handler
                .on_disposition(state.recipient(), state.disposition())
                .await;
        }
    }

    async fn record_error(&mut self, index: usize, error: &Transfer) {
        let keep = error.class() == ErrorClass::Soft;
        self.record(index, keep, Verdict::from_transfer(error)).await;
    }

    async fn record_error_accepted(&mut self, error: &Transfer) {
        for index in self.accepted.clone() {
            self.record_error(index, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest::rstest]
    #[case(ProtocolState::Mail, ProtocolState::Mail, true)]
    #[case(ProtocolState::Mail, ProtocolState::Rcpt, true)]
    #[case(ProtocolState::Rcpt, ProtocolState::Dot, true)]
    #[case(ProtocolState::Data, ProtocolState::Rcpt, false)]
    #[case(ProtocolState::Last, ProtocolState::Quit, false)]
    fn reply_cursor_stays_behind(
        #[case] recv: ProtocolState,
        #[case] send: ProtocolState,
        #[case] expected: bool,
    ) {
        assert_eq!(cursors_ordered(recv, send), expected);
    }

    #[test]
    fn steps_answer_for_their_state() {
        assert_eq!(Step::DotSmtp.state(), ProtocolState::Dot);
        assert_eq!(Step::DotLmtp(3).state(), ProtocolState::Dot);
        assert_eq!(Step::Rcpt(0).state(), ProtocolState::Rcpt);
        assert_eq!(Step::Abort.state(), ProtocolState::Abort);
    }
}
