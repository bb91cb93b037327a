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

use crate::extensions::{self, Extension};
use crate::transfer_error::Protocol;
use petrel_protocol::{Reply, XforwardAttrs};

/// The `EHLO` (or `LHLO`) response of a server, one advertised keyword
/// per line after the server name.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, fake::Dummy)]
pub struct Ehlo {
    reply: Reply,
    server_name: String,
    extensions: Vec<(Extension, String)>,
}

impl Ehlo {
    #[must_use]
    pub fn contains(&self, extension: Extension) -> bool {
        self.extensions.iter().any(|(e, _)| *e == extension)
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    #[must_use]
    pub const fn reply(&self) -> &Reply {
        &self.reply
    }

    /// Whatever followed the keyword on its `EHLO` line, trimmed.
    #[must_use]
    pub fn parameters(&self, extension: Extension) -> Option<&str> {
        self.extensions
            .iter()
            .find(|(e, _)| *e == extension)
            .map(|(_, args)| args.trim())
    }

    /// The advertised message size limit, `Some(0)` when the server
    /// announced `SIZE` without a fixed limit.
    #[must_use]
    pub fn size_limit(&self) -> Option<u64> {
        self.parameters(Extension::Size)
            .map(|args| args.parse().unwrap_or(0))
    }

    /// Which `XFORWARD` attributes the server is willing to take.
    #[must_use]
    pub fn xforward_attrs(&self) -> XforwardAttrs {
        self.parameters(Extension::Xforward)
            .map_or_else(XforwardAttrs::default, |args| {
                XforwardAttrs::from_keywords(args.split_whitespace())
            })
    }
}

impl TryFrom<Reply> for Ehlo {
    type Error = Protocol;

    fn try_from(reply: Reply) -> Result<Self, Self::Error> {
        if reply.code().value() != 250 {
            return Err(Protocol::ServerReject {
                request: "EHLO command".to_owned(),
                reply,
            });
        }
        if reply.is_protocol_error() {
            return Err(Protocol::MalformedReply {
                during: "parsing the EHLO response".to_owned(),
                reply,
            });
        }

        // every stored line starts with `250<sp|->`, the keywords come after.
        let mut lines = reply.lines().map(|line| line.get(4..).unwrap_or(""));
        let server_name = lines
            .next()
            .map(|greeting| {
                greeting
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_owned()
            })
            .unwrap_or_default();

        let extensions = lines
            .map(extensions::from_str)
            .map(|(verb, args)| (verb, args.to_owned()))
            .collect::<Vec<_>>();

        if server_name.is_empty() {
            return Err(Protocol::MalformedReply {
                during: "parsing the EHLO response".to_owned(),
                reply,
            });
        }

        Ok(Self {
            reply,
            server_name,
            extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(raw: &str) -> Result<Ehlo, Protocol> {
        raw.parse::<Reply>().unwrap().try_into()
    }

    #[test]
    fn full_feature_set() {
        let ehlo = parse(
            "250-mail.example.com says hello\r\n\
             250-PIPELINING\r\n\
             250-SIZE 35882577\r\n\
             250-XFORWARD NAME ADDR PORT\r\n\
             250-8BITMIME\r\n\
             250-STARTTLS\r\n\
             250-AUTH PLAIN LOGIN\r\n\
             250 DSN",
        )
        .unwrap();

        assert_eq!(ehlo.server_name(), "mail.example.com");
        assert!(ehlo.contains(Extension::Pipelining));
        assert!(ehlo.contains(Extension::BitMime8));
        assert!(ehlo.contains(Extension::StartTls));
        assert!(ehlo.contains(Extension::DeliveryStatusNotification));
        assert_eq!(ehlo.parameters(Extension::Auth), Some("PLAIN LOGIN"));
        assert_eq!(ehlo.size_limit(), Some(35_882_577));

        let attrs = ehlo.xforward_attrs();
        assert!(attrs.name && attrs.addr && attrs.port);
        assert!(!attrs.proto && !attrs.helo);
    }

    #[test]
    fn single_line_response() {
        let ehlo = parse("250 mx.example.com").unwrap();
        assert_eq!(ehlo.server_name(), "mx.example.com");
        assert!(!ehlo.contains(Extension::Pipelining));
        assert_eq!(ehlo.size_limit(), None);
    }

    #[test]
    fn size_without_a_limit() {
        let ehlo = parse("250-mx.example.com\r\n250 SIZE").unwrap();
        assert_eq!(ehlo.size_limit(), Some(0));
    }

    #[test]
    fn rejection_is_kept_as_is() {
        assert!(matches!(
            parse("502 command not implemented"),
            Err(Protocol::ServerReject { .. })
        ));
    }
}
