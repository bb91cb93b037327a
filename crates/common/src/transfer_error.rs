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

use petrel_protocol::{Domain, Reply, Severity};

/// Error produced by the MX/address lookup of a destination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lookup {
    /// The name does not exist, trying again will not help.
    #[error("'{domain}': host or domain name not found")]
    NotFound {
        /// Domain of the DNS zone
        domain: Domain,
    },

    /// The name exists but declines mail, per RFC 7505.
    #[error("'{domain}' does not accept mail (null MX)")]
    NullMx {
        /// Domain of the DNS zone
        domain: Domain,
    },

    /// The server answered with something unusable.
    #[error("lookup of '{domain}' failed: {message}")]
    Fail {
        /// Domain of the DNS zone
        domain: Domain,
        message: String,
    },

    /// The lookup could not complete, worth retrying later.
    #[error("temporary lookup failure for '{domain}': {message}")]
    Retry {
        /// Domain of the DNS zone
        domain: Domain,
        message: String,
    },

    /// Every preferred mail exchange is ourselves.
    #[error("mail for '{destination}' loops back to myself")]
    Loop {
        /// Destination as addressed, either a domain or an address literal.
        destination: String,
    },
}

/// Error of the underlying connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[error("cannot connect to {target}: {message}")]
    Connect { target: String, message: String },

    /// One of the per-phase timers fired, `during` names the phase.
    #[error("conversation timed out while {during}")]
    Timeout { during: String },

    #[error("lost connection with the peer")]
    Eof,

    /// The connection broke while the message body was on its way and a
    /// final salvage read produced no usable rejection either.
    #[error("lost connection while sending message body")]
    LostBody,

    #[error("io error: {message}")]
    Io { message: String },
}

impl Transport {
    /// Keeps the phase of the exchange in the error when the io layer
    /// does not.
    #[must_use]
    pub fn from_io(error: &std::io::Error, during: &str) -> Self {
        match error.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::Eof,
            std::io::ErrorKind::TimedOut => Self::Timeout {
                during: during.to_owned(),
            },
            _ => Self::Io {
                message: error.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for Transport {
    #[inline]
    fn from(error: std::io::Error) -> Self {
        Self::from_io(&error, "talking to the peer")
    }
}

/// The server answered, but not with what we needed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// A well-formed `4xx`/`5xx` answer to one of our requests.
    #[error("server rejected our {request}: {reply}")]
    ServerReject { request: String, reply: Reply },

    /// The answer could not be parsed as an SMTP reply.
    #[error("malformed server reply while {during}: {reply}")]
    MalformedReply { during: String, reply: Reply },
}

/// The message itself cannot be sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    #[error("message content could not be produced: {message}")]
    TransformFailed { message: String },
}

/// Anything that can cut a delivery attempt short.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transfer {
    #[error(transparent)]
    Lookup(#[from] Lookup),
    #[error(transparent)]
    Transport(#[from] Transport),
    #[error(transparent)]
    Protocol(#[from] Protocol),
    #[error(transparent)]
    Content(#[from] Content),
}

/// How an error weighs on the fate of the recipients it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt later.
    Soft,
    /// Give up on the touched recipients.
    Hard,
    /// Delivering remotely would send the mail back to us.
    Loop,
}

/// Category used to decide whether the postmaster hears about it,
/// mirrored by the `notify_classes` setting.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    serde_with::DeserializeFromStr,
    serde_with::SerializeDisplay,
    fake::Dummy,
)]
#[strum(serialize_all = "snake_case")]
pub enum NotifyClass {
    /// Mail could not be delivered and bounces.
    Bounce,
    /// Mail stays queued for a later attempt.
    Delay,
    /// The remote server misbehaved at the protocol level.
    Protocol,
    /// A local resource problem, not the remote server's fault.
    Resource,
}

impl Transfer {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Lookup(Lookup::Retry { .. }) => ErrorClass::Soft,
            Self::Lookup(Lookup::Loop { .. }) => ErrorClass::Loop,
            Self::Lookup(_) | Self::Content(_) => ErrorClass::Hard,
            Self::Transport(_) | Self::Protocol(Protocol::MalformedReply { .. }) => {
                ErrorClass::Soft
            }
            Self::Protocol(Protocol::ServerReject { reply, .. }) => {
                if matches!(reply.severity(), Severity::PermanentNegative) {
                    ErrorClass::Hard
                } else {
                    ErrorClass::Soft
                }
            }
        }
    }

    #[must_use]
    pub fn notify_class(&self) -> NotifyClass {
        match self {
            Self::Protocol(Protocol::MalformedReply { .. }) => NotifyClass::Protocol,
            Self::Content(_) => NotifyClass::Resource,
            _ => match self.class() {
                ErrorClass::Soft => NotifyClass::Delay,
                ErrorClass::Hard | ErrorClass::Loop => NotifyClass::Bounce,
            },
        }
    }

    /// Enhanced status code to fall back on when the server did not
    /// provide one.
    #[must_use]
    pub fn default_status(&self) -> &'static str {
        match self.class() {
            ErrorClass::Soft => "4.0.0",
            ErrorClass::Hard | ErrorClass::Loop => "5.0.0",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn reply(raw: &str) -> Reply {
        raw.parse().unwrap()
    }

    #[rstest]
    #[case::transient_reject(
        Protocol::ServerReject {
            request: "RCPT TO command".to_owned(),
            reply: reply("452 4.5.3 too many recipients"),
        }
        .into(),
        ErrorClass::Soft
    )]
    #[case::permanent_reject(
        Protocol::ServerReject {
            request: "MAIL FROM command".to_owned(),
            reply: reply("550 no thanks"),
        }
        .into(),
        ErrorClass::Hard
    )]
    #[case::eof(Transport::Eof.into(), ErrorClass::Soft)]
    #[case::null_mx(
        Lookup::NullMx { domain: "example.com".parse().unwrap() }.into(),
        ErrorClass::Hard
    )]
    #[case::self_loop(
        Lookup::Loop { destination: "example.com".to_owned() }.into(),
        ErrorClass::Loop
    )]
    fn classification(#[case] error: Transfer, #[case] class: ErrorClass) {
        assert_eq!(error.class(), class);
    }

    #[rstest]
    #[case::timeout(
        Transport::Timeout { during: "sending message body".to_owned() }.into(),
        NotifyClass::Delay
    )]
    #[case::garbage(
        Protocol::MalformedReply {
            during: "sending RCPT TO".to_owned(),
            reply: reply("250 ok"),
        }
        .into(),
        NotifyClass::Protocol
    )]
    #[case::bounced(
        Protocol::ServerReject {
            request: "end of DATA command".to_owned(),
            reply: reply("554 transaction failed"),
        }
        .into(),
        NotifyClass::Bounce
    )]
    fn notify_classification(#[case] error: Transfer, #[case] class: NotifyClass) {
        assert_eq!(error.notify_class(), class);
    }

    #[test]
    fn io_errors_keep_their_phase() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Transport::from_io(&eof, "reading the greeting"), Transport::Eof);

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(
            Transport::from_io(&timed_out, "sending MAIL FROM"),
            Transport::Timeout {
                during: "sending MAIL FROM".to_owned()
            }
        );
    }
}
