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

use crate::{Mailbox, Recipient};
use petrel_protocol::{BodyType, Domain, DsnReturn, XforwardParams};

#[derive(Debug, thiserror::Error)]
pub enum SiteNameFromStrError {
    #[error("empty destination")]
    Empty,
    #[error("cannot parse destination {0:?}")]
    CannotParse(String),
    #[error("invalid port in destination {0:?}")]
    InvalidPort(String),
}

/// Where a destination may actually be contacted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SiteHost {
    Domain(Domain),
    Ip(std::net::IpAddr),
}

/// A destination site: `domain`, `domain:port`, or a bracketed form
/// (`[host]`, `[addr]`, `[IPv6:addr]`) which turns MX lookups off.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, serde_with::SerializeDisplay, serde_with::DeserializeFromStr,
)]
pub struct SiteName {
    host: SiteHost,
    port: Option<u16>,
    mx_disabled: bool,
}

impl SiteName {
    /// Site reached through the MX records of `domain`.
    #[must_use]
    pub const fn from_domain(domain: Domain) -> Self {
        Self {
            host: SiteHost::Domain(domain),
            port: None,
            mx_disabled: false,
        }
    }

    #[must_use]
    pub const fn host(&self) -> &SiteHost {
        &self.host
    }

    /// Port override, `None` means the configured default.
    #[must_use]
    pub const fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether the destination goes through an MX lookup at all.
    #[must_use]
    pub const fn wants_mx(&self) -> bool {
        matches!(self.host, SiteHost::Domain(_)) && !self.mx_disabled
    }
}

fn parse_port(input: &str, original: &str) -> Result<u16, SiteNameFromStrError> {
    input
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| SiteNameFromStrError::InvalidPort(original.to_owned()))
}

impl std::str::FromStr for SiteName {
    type Err = SiteNameFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SiteNameFromStrError::Empty);
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (inside, trailer) = rest
                .split_once(']')
                .ok_or_else(|| SiteNameFromStrError::CannotParse(s.to_owned()))?;
            if inside.is_empty() {
                return Err(SiteNameFromStrError::CannotParse(s.to_owned()));
            }

            let port = match trailer.strip_prefix(':') {
                Some(port) => Some(parse_port(port, s)?),
                None if trailer.is_empty() => None,
                None => return Err(SiteNameFromStrError::CannotParse(s.to_owned())),
            };

            let host = if let Some(ip6) = inside.strip_prefix("IPv6:") {
                SiteHost::Ip(
                    ip6.parse::<std::net::Ipv6Addr>()
                        .map_err(|_| SiteNameFromStrError::CannotParse(s.to_owned()))?
                        .into(),
                )
            } else if let Ok(ip) = inside.parse::<std::net::IpAddr>() {
                SiteHost::Ip(ip)
            } else {
                SiteHost::Domain(
                    inside
                        .parse()
                        .map_err(|_| SiteNameFromStrError::CannotParse(s.to_owned()))?,
                )
            };

            return Ok(Self {
                host,
                port,
                mx_disabled: true,
            });
        }

        let (host_part, port) = match s.rsplit_once(':') {
            // a second ':' means a bare IPv6 address, those need brackets.
            Some((host, _)) if host.contains(':') => {
                return Err(SiteNameFromStrError::CannotParse(s.to_owned()));
            }
            Some((host, port)) => (host, Some(parse_port(port, s)?)),
            None => (s, None),
        };

        let host = if let Ok(ip) = host_part.parse::<std::net::Ipv4Addr>() {
            SiteHost::Ip(ip.into())
        } else {
            SiteHost::Domain(
                host_part
                    .parse()
                    .map_err(|_| SiteNameFromStrError::CannotParse(s.to_owned()))?,
            )
        };

        Ok(Self {
            host,
            port,
            mx_disabled: false,
        })
    }
}

impl std::fmt::Display for SiteName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            SiteHost::Domain(domain) if self.mx_disabled => write!(f, "[{domain}]")?,
            SiteHost::Domain(domain) => write!(f, "{domain}")?,
            SiteHost::Ip(std::net::IpAddr::V4(ip)) => write!(f, "[{ip}]")?,
            SiteHost::Ip(std::net::IpAddr::V6(ip)) => write!(f, "[IPv6:{ip}]")?,
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Everything needed to get one message to one destination.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeliveryRequest {
    pub uuid: uuid::Uuid,
    /// Primary destination, fallback relays come from the configuration.
    pub nexthop: SiteName,
    /// `None` is the null sender, used by delivery reports.
    pub reverse_path: Option<Mailbox>,
    pub rcpt_to: Vec<Recipient>,
    /// `ENVID` to replay in `MAIL FROM`, RFC 3461.
    pub envelop_id: Option<String>,
    /// `RET` to replay in `MAIL FROM`, RFC 3461.
    pub ret: Option<DsnReturn>,
    /// What the message body claims to be.
    pub body_type: Option<BodyType>,
    /// Attributes of the up-stream client, for servers taking `XFORWARD`.
    pub xforward: XforwardParams,
    /// Used for the `SIZE` pre-check, `0` when unknown.
    pub size_estimate: u64,
}

impl DeliveryRequest {
    #[must_use]
    pub fn new(nexthop: SiteName, reverse_path: Option<Mailbox>, rcpt_to: Vec<Recipient>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4(),
            nexthop,
            reverse_path,
            rcpt_to,
            envelop_id: None,
            ret: None,
            body_type: None,
            xforward: XforwardParams::default(),
            size_estimate: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case::domain("mail.example.com", None, true)]
    #[case::domain_with_port("mail.example.com:2525", Some(2525), true)]
    #[case::bracketed_domain("[mail.example.com]", None, false)]
    #[case::ip4("[192.0.2.7]", None, false)]
    #[case::ip4_with_port("[192.0.2.7]:587", Some(587), false)]
    #[case::ip6("[IPv6:2001:db8::1]:2525", Some(2525), false)]
    fn destination_syntax(#[case] input: &str, #[case] port: Option<u16>, #[case] wants_mx: bool) {
        let site = input.parse::<SiteName>().unwrap();
        assert_eq!(site.port(), port);
        assert_eq!(site.wants_mx(), wants_mx);
        assert_eq!(site.to_string(), input);
    }

    #[test]
    fn bare_address_goes_direct() {
        let site = "198.51.100.7".parse::<SiteName>().unwrap();
        assert_eq!(
            site.host(),
            &SiteHost::Ip("198.51.100.7".parse().unwrap())
        );
        assert!(!site.wants_mx());
    }

    #[test]
    fn bare_ipv6_wants_brackets() {
        let site = "[::1]".parse::<SiteName>().unwrap();
        assert_eq!(site.to_string(), "[IPv6:::1]");

        assert!(matches!(
            "2001:db8::1".parse::<SiteName>(),
            Err(SiteNameFromStrError::CannotParse(_))
        ));
    }

    #[rstest]
    #[case::empty("", "empty destination")]
    #[case::unclosed_bracket("[example.com", "cannot parse destination \"[example.com\"")]
    #[case::empty_literal("[]", "cannot parse destination \"[]\"")]
    #[case::port_overflow("example.com:99999", "invalid port in destination \"example.com:99999\"")]
    #[case::port_zero("example.com:0", "invalid port in destination \"example.com:0\"")]
    #[case::named_port("example.com:smtp", "invalid port in destination \"example.com:smtp\"")]
    fn rejected_destinations(#[case] input: &str, #[case] message: &str) {
        assert_eq!(input.parse::<SiteName>().unwrap_err().to_string(), message);
    }

    #[test]
    fn serialized_as_string() {
        assert_eq!(
            serde_json::to_string(&"smtp.example.com:2525".parse::<SiteName>().unwrap()).unwrap(),
            r#""smtp.example.com:2525""#
        );
    }
}
