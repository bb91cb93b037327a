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

use crate::{
    transfer_error::{ErrorClass, Protocol, Transfer},
    Recipient,
};
use petrel_protocol::Reply;

/// <https://datatracker.ietf.org/doc/html/rfc3464#section-2.3.3>
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Delivered,
    Delayed,
    Failed,
}

impl Action {
    #[must_use]
    pub const fn is_successful(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Final word on one recipient, with the fields a delivery report needs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Verdict {
    pub action: Action,
    /// RFC 3463 status, taken from the reply when it carries one.
    pub status: String,
    /// Human readable cause, quoted verbatim in reports.
    pub diagnostic: String,
}

impl Verdict {
    /// The server took responsibility for this recipient.
    #[must_use]
    pub fn delivered(reply: &Reply) -> Self {
        Self {
            action: Action::Delivered,
            status: reply
                .code()
                .details()
                .map_or_else(|| "2.0.0".to_owned(), str::to_owned),
            diagnostic: reply.to_string(),
        }
    }

    #[must_use]
    pub fn from_transfer(error: &Transfer) -> Self {
        let action = match error.class() {
            ErrorClass::Soft => Action::Delayed,
            ErrorClass::Hard | ErrorClass::Loop => Action::Failed,
        };
        let status = match error {
            Transfer::Protocol(Protocol::ServerReject { reply, .. }) => reply.code().details(),
            _ => None,
        }
        .map_or_else(|| error.default_status().to_owned(), str::to_owned);

        Self {
            action,
            status,
            diagnostic: error.to_string(),
        }
    }
}

/// What to do with a recipient once an attempt has run its course.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// No decision yet, another host (or a later attempt) must be tried.
    Unmarked,
    /// Keep the recipient in the queue for a later attempt.
    Keep(Verdict),
    /// Remove the recipient from the queue, delivered or bounced.
    Drop(Verdict),
}

/// A recipient plus its decision state. A decision is made at most once per
/// delivery: later, lower ranked causes never overwrite an earlier verdict.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecipientState {
    recipient: Recipient,
    disposition: Disposition,
}

impl RecipientState {
    #[must_use]
    pub const fn new(recipient: Recipient) -> Self {
        Self {
            recipient,
            disposition: Disposition::Unmarked,
        }
    }

    #[must_use]
    pub const fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    #[must_use]
    pub const fn disposition(&self) -> &Disposition {
        &self.disposition
    }

    #[must_use]
    pub const fn is_unmarked(&self) -> bool {
        matches!(self.disposition, Disposition::Unmarked)
    }

    /// Returns whether the verdict was recorded.
    pub fn mark_keep(&mut self, verdict: Verdict) -> bool {
        self.mark(Disposition::Keep(verdict))
    }

    /// Returns whether the verdict was recorded.
    pub fn mark_drop(&mut self, verdict: Verdict) -> bool {
        self.mark(Disposition::Drop(verdict))
    }

    fn mark(&mut self, disposition: Disposition) -> bool {
        if self.is_unmarked() {
            self.disposition = disposition;
            true
        } else {
            false
        }
    }
}

/// How a whole delivery ended. Carries every recipient back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Every recipient carries a terminal disposition.
    Completed { recipients: Vec<RecipientState> },
    /// The best mail exchange is this very host: the whole request must be
    /// handed to another transport, recipients untouched.
    Reroute {
        transport: String,
        recipients: Vec<RecipientState>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer_error::Transport;
    use fake::{Fake, Faker};
    use pretty_assertions::assert_eq;

    #[test]
    fn status_comes_from_the_reply() {
        let reply = "250 2.1.5 destination ok".parse::<Reply>().unwrap();
        let verdict = Verdict::delivered(&reply);
        assert_eq!(verdict.action, Action::Delivered);
        assert_eq!(verdict.status, "2.1.5");
        assert_eq!(verdict.diagnostic, "250 2.1.5 destination ok");

        let terse = "250 ok".parse::<Reply>().unwrap();
        assert_eq!(Verdict::delivered(&terse).status, "2.0.0");
    }

    #[test]
    fn rejection_keeps_the_server_status() {
        let reply = "550 5.1.1 no such user".parse::<Reply>().unwrap();
        let verdict = Verdict::from_transfer(
            &Protocol::ServerReject {
                request: "RCPT TO command".to_owned(),
                reply,
            }
            .into(),
        );
        assert_eq!(verdict.action, Action::Failed);
        assert_eq!(verdict.status, "5.1.1");
    }

    #[test]
    fn soft_errors_delay() {
        let verdict = Verdict::from_transfer(
            &Transport::Timeout {
                during: "sending message body".to_owned(),
            }
            .into(),
        );
        assert_eq!(verdict.action, Action::Delayed);
        assert_eq!(verdict.status, "4.0.0");
    }

    #[test]
    fn first_verdict_wins() {
        let mut state = RecipientState::new(Faker.fake());
        assert!(state.is_unmarked());

        let first = Verdict::delivered(&"250 ok".parse().unwrap());
        assert!(state.mark_drop(first.clone()));
        assert!(!state.mark_keep(Verdict::from_transfer(
            &Transport::Eof.into()
        )));

        assert_eq!(state.disposition(), &Disposition::Drop(first));
    }
}
