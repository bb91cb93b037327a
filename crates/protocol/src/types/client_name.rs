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

use crate::Domain;

#[derive(Debug, thiserror::Error)]
pub enum ClientNameFromStrError {
    #[error("`{0}` is neither a domain nor an address literal")]
    CannotParse(String),
}

/// Name we announce ourselves with, in `HELO`/`EHLO`/`LHLO` and in the
/// session cache key.
#[derive(
    Debug,
    Clone,
    PartialOrd,
    Ord,
    PartialEq,
    Eq,
    Hash,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
)]
pub enum ClientName {
    /// A fully qualified hostname.
    Domain(Domain),
    /// An IPv4 address literal.
    Ip4(std::net::Ipv4Addr),
    /// An IPv6 address literal.
    Ip6(std::net::Ipv6Addr),
}

impl std::str::FromStr for ClientName {
    type Err = ClientNameFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cannot_parse = || ClientNameFromStrError::CannotParse(s.to_owned());
        if let Some(literal) = s.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            return if let Some(ip6) = literal.strip_prefix("IPv6:") {
                ip6.parse().map(Self::Ip6).map_err(|_| cannot_parse())
            } else {
                literal.parse().map(Self::Ip4).map_err(|_| cannot_parse())
            };
        }
        s.parse().map(Self::Domain).map_err(|_| cannot_parse())
    }
}

impl std::fmt::Display for ClientName {
    /// Prints the form that goes on the wire, address literals come out
    /// bracketed.
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(domain) => write!(f, "{domain}"),
            Self::Ip4(ip) => write!(f, "[{ip}]"),
            Self::Ip6(ip) => write!(f, "[IPv6:{ip}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case::domain("mail.example.com")]
    #[case::ip4("[192.0.2.25]")]
    #[case::ip6("[IPv6:2001:db8::1]")]
    fn round_trip(#[case] input: &str) {
        let client_name = input.parse::<ClientName>().unwrap();
        assert_eq!(client_name.to_string(), input);
    }

    #[test]
    fn literal_variants() {
        assert_eq!(
            "[192.0.2.25]".parse::<ClientName>().unwrap(),
            ClientName::Ip4("192.0.2.25".parse().unwrap())
        );
        assert_eq!(
            "[IPv6:2001:db8::1]".parse::<ClientName>().unwrap(),
            ClientName::Ip6("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn bad_literal_is_rejected() {
        assert!("[not an ip]".parse::<ClientName>().is_err());
    }

    #[test]
    fn serialized_as_string() {
        assert_eq!(
            serde_json::from_str::<ClientName>(r#""mail.example.com""#).unwrap(),
            ClientName::Domain("mail.example.com".parse().unwrap())
        );
        assert_eq!(
            serde_json::to_string(&ClientName::Ip4("192.0.2.25".parse().unwrap())).unwrap(),
            r#""[192.0.2.25]""#
        );
    }
}
