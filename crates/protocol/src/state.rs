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

/// One step of the client side of an SMTP transaction.
///
/// The sender and the receiver halves of a pipelined session each hold their
/// own cursor of this type. The declaration order is the order commands go
/// out on the wire, so the derived [`Ord`] gives the invariant that the
/// receiver cursor never runs ahead of the sender cursor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter, strum::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolState {
    /// Sending the XFORWARD NAME/ADDR/PORT attributes.
    XfwdNameAddr,
    /// Sending the XFORWARD PROTO/HELO attributes.
    XfwdProtoHelo,
    /// Sending the MAIL FROM command.
    Mail,
    /// Sending one RCPT TO command, the index being tracked separately.
    Rcpt,
    /// Sending the DATA command.
    Data,
    /// Sending the message content and the final `.`.
    Dot,
    /// Sending RSET to cancel a transaction that cannot proceed.
    Abort,
    /// Sending RSET to probe a session taken from the cache.
    Rset,
    /// Sending QUIT.
    Quit,
    /// Nothing left to send or receive.
    Last,
}

impl ProtocolState {
    /// What the client is doing in this state, for diagnostics handed to
    /// users and to the postmaster.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::XfwdNameAddr => "sending XFORWARD name/address",
            Self::XfwdProtoHelo => "sending XFORWARD protocol/helo name",
            Self::Mail => "sending MAIL FROM",
            Self::Rcpt => "sending RCPT TO",
            Self::Data => "sending DATA command",
            Self::Dot => "sending end of data -- message may be sent more than once",
            Self::Abort => "sending final RSET",
            Self::Rset => "sending RSET",
            Self::Quit => "sending QUIT",
            Self::Last => "closing session",
        }
    }

    /// The wire command this state answers for, phrased for "in reply to"
    /// diagnostics.
    #[must_use]
    pub const fn request(self) -> &'static str {
        match self {
            Self::XfwdNameAddr => "XFORWARD name/address command",
            Self::XfwdProtoHelo => "XFORWARD protocol/helo name command",
            Self::Mail => "MAIL FROM command",
            Self::Rcpt => "RCPT TO command",
            Self::Data => "DATA command",
            Self::Dot => "end of DATA command",
            Self::Abort => "final RSET command",
            Self::Rset => "RSET command",
            Self::Quit => "QUIT command",
            Self::Last => "end of session",
        }
    }

    /// States at which the sender must stop and let the receiver catch up
    /// before going further, whatever the pipelining budget says.
    #[must_use]
    pub const fn is_sync_point(self) -> bool {
        matches!(self, Self::Dot | Self::Last)
    }
}

#[cfg(test)]
mod tests {
    use super::ProtocolState;

    #[test]
    fn wire_order() {
        // the receiver cursor is compared against the sender cursor, so the
        // variants must stay in the order commands are emitted.
        let mut previous = None;
        for state in <ProtocolState as strum::IntoEnumIterator>::iter() {
            if let Some(previous) = previous {
                assert!(previous < state);
            }
            previous = Some(state);
        }
        pretty_assertions::assert_eq!(previous, Some(ProtocolState::Last));
    }

    #[rstest::rstest]
    #[case(ProtocolState::Mail, false)]
    #[case(ProtocolState::Rcpt, false)]
    #[case(ProtocolState::Data, false)]
    #[case(ProtocolState::Dot, true)]
    #[case(ProtocolState::Last, true)]
    fn sync_points(#[case] state: ProtocolState, #[case] expected: bool) {
        pretty_assertions::assert_eq!(state.is_sync_point(), expected);
    }

    #[test]
    fn labels_are_distinct() {
        let labels = <ProtocolState as strum::IntoEnumIterator>::iter()
            .map(ProtocolState::label)
            .collect::<std::collections::HashSet<_>>();
        pretty_assertions::assert_eq!(
            labels.len(),
            <ProtocolState as strum::IntoEnumIterator>::iter().count()
        );
    }
}
