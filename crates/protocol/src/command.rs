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

use crate::{Address, ClientName};

pub const DATA: &str = "DATA\r\n";
pub const RSET: &str = "RSET\r\n";
pub const QUIT: &str = "QUIT\r\n";
pub const STARTTLS: &str = "STARTTLS\r\n";

/// Placeholder sent for a forwarded attribute we do not know.
pub const XFORWARD_UNAVAILABLE: &str = "[UNAVAILABLE]";

/// When the recipient wants to be notified of the status of the delivery.
///
/// See [RFC 3461](https://datatracker.ietf.org/doc/html/rfc3461).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOn {
    Some {
        success: bool,
        failure: bool,
        delay: bool,
    },
    Never,
}

impl Default for NotifyOn {
    fn default() -> Self {
        Self::Some {
            success: false,
            failure: true,
            delay: true,
        }
    }
}

impl std::fmt::Display for NotifyOn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Some {
                success,
                failure,
                delay,
            } => {
                let keywords = [("SUCCESS", success), ("FAILURE", failure), ("DELAY", delay)]
                    .into_iter()
                    .filter_map(|(value, activated)| activated.then_some(value))
                    .collect::<Vec<_>>();
                if keywords.is_empty() {
                    // "NOTIFY=" with no keyword is not valid on the wire.
                    f.write_str("NEVER")
                } else {
                    f.write_str(&keywords.join(","))
                }
            }
            Self::Never => f.write_str("NEVER"),
        }
    }
}

/// Address of the recipient before it got rewritten or expanded.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct OriginalRecipient {
    /// Often `rfc822`.
    pub addr_type: String,
    pub mailbox: Address,
}

/// How much of the original message should come back with a delivery report.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum DsnReturn {
    #[default]
    #[strum(serialize = "HDRS")]
    Headers,
    #[strum(serialize = "FULL")]
    Full,
}

/// Value of the `BODY=` parameter of `MAIL FROM`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum BodyType {
    #[strum(serialize = "7BIT")]
    SevenBit,
    #[strum(serialize = "8BITMIME")]
    EightBitMime,
}

/// Parameters appended to `MAIL FROM`, each gated on the matching
/// extension being advertised by the server.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MailParams {
    /// `SIZE=`, the size of the message in bytes.
    pub size: Option<u64>,
    /// `BODY=`.
    pub body: Option<BodyType>,
    /// `ENVID=`, an identifier copied verbatim into delivery reports.
    pub envelop_id: Option<String>,
    /// `RET=`.
    pub ret: Option<DsnReturn>,
}

/// Attributes of the up-stream client, replayed to a server which
/// advertised `XFORWARD`.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct XforwardParams {
    /// Hostname of the up-stream client.
    pub name: Option<String>,
    /// Printable address of the up-stream client.
    pub addr: Option<String>,
    /// TCP port of the up-stream client.
    pub port: Option<String>,
    /// Protocol the up-stream client spoke (e.g. `ESMTP`).
    pub proto: Option<String>,
    /// Hostname announced by the up-stream client.
    pub helo: Option<String>,
}

/// Which `XFORWARD` attributes the server accepts, taken from its EHLO
/// response.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, fake::Dummy,
)]
pub struct XforwardAttrs {
    pub name: bool,
    pub addr: bool,
    pub port: bool,
    pub proto: bool,
    pub helo: bool,
}

impl XforwardAttrs {
    #[must_use]
    pub fn from_keywords<'item>(keywords: impl Iterator<Item = &'item str>) -> Self {
        let mut attrs = Self::default();
        for keyword in keywords {
            match keyword.to_ascii_uppercase().as_str() {
                "NAME" => attrs.name = true,
                "ADDR" => attrs.addr = true,
                "PORT" => attrs.port = true,
                "PROTO" => attrs.proto = true,
                "HELO" => attrs.helo = true,
                _ => {}
            }
        }
        attrs
    }

    #[must_use]
    pub const fn accepts_name_addr(&self) -> bool {
        self.name || self.addr || self.port
    }

    #[must_use]
    pub const fn accepts_proto_helo(&self) -> bool {
        self.proto || self.helo
    }
}

/// Encode a value as xtext, see [RFC 3461 §4](https://datatracker.ietf.org/doc/html/rfc3461#section-4).
#[must_use]
pub fn xtext(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if (33..=126).contains(&byte) && byte != b'+' && byte != b'=' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("+{byte:02X}"));
        }
    }
    out
}

#[must_use]
pub fn ehlo(client_name: &ClientName) -> String {
    format!("EHLO {client_name}\r\n")
}

#[must_use]
pub fn helo(client_name: &ClientName) -> String {
    format!("HELO {client_name}\r\n")
}

#[must_use]
pub fn lhlo(client_name: &ClientName) -> String {
    format!("LHLO {client_name}\r\n")
}

#[must_use]
pub fn mail_from(reverse_path: Option<&Address>, params: &MailParams) -> String {
    let MailParams {
        size,
        body,
        envelop_id,
        ret,
    } = params;

    let mut command = format!(
        "MAIL FROM:<{}>",
        reverse_path.map_or_else(String::new, ToString::to_string)
    );
    if let Some(size) = size {
        command.push_str(&format!(" SIZE={size}"));
    }
    if let Some(body) = body {
        command.push_str(&format!(" BODY={body}"));
    }
    if let Some(ret) = ret {
        command.push_str(&format!(" RET={ret}"));
    }
    if let Some(envelop_id) = envelop_id {
        command.push_str(&format!(" ENVID={}", xtext(envelop_id)));
    }
    command.push_str("\r\n");
    command
}

#[must_use]
pub fn rcpt_to(
    forward_path: &Address,
    original_forward_path: Option<&OriginalRecipient>,
    notify_on: Option<&NotifyOn>,
) -> String {
    let mut command = format!("RCPT TO:<{forward_path}>");
    if let Some(orcpt) = original_forward_path {
        command.push_str(&format!(
            " ORCPT={};{}",
            orcpt.addr_type,
            xtext(orcpt.mailbox.full())
        ));
    }
    if let Some(notify_on) = notify_on {
        command.push_str(&format!(" NOTIFY={notify_on}"));
    }
    command.push_str("\r\n");
    command
}

fn xforward(attrs: &[(&str, bool, Option<&str>)]) -> Option<String> {
    if attrs.iter().all(|(_, accepted, _)| !accepted) {
        return None;
    }
    let mut command = "XFORWARD".to_owned();
    for (key, accepted, value) in attrs {
        if *accepted {
            command.push_str(&format!(
                " {key}={}",
                xtext(value.unwrap_or(XFORWARD_UNAVAILABLE))
            ));
        }
    }
    command.push_str("\r\n");
    Some(command)
}

/// First round of forwarded attributes, `None` when the server accepts
/// none of them.
#[must_use]
pub fn xforward_name_addr(params: &XforwardParams, attrs: XforwardAttrs) -> Option<String> {
    xforward(&[
        ("NAME", attrs.name, params.name.as_deref()),
        ("ADDR", attrs.addr, params.addr.as_deref()),
        ("PORT", attrs.port, params.port.as_deref()),
    ])
}

/// Second round of forwarded attributes, `None` when the server accepts
/// none of them.
#[must_use]
pub fn xforward_proto_helo(params: &XforwardParams, attrs: XforwardAttrs) -> Option<String> {
    xforward(&[
        ("PROTO", attrs.proto, params.proto.as_deref()),
        ("HELO", attrs.helo, params.helo.as_deref()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn address(full: &str) -> Address {
        full.parse().unwrap()
    }

    #[rstest]
    #[case::domain(
        ClientName::Domain("client.example.com".parse().unwrap()),
        "EHLO client.example.com\r\n"
    )]
    #[case::ip4(
        ClientName::Ip4("192.0.2.25".parse().unwrap()),
        "EHLO [192.0.2.25]\r\n"
    )]
    #[case::ip6(ClientName::Ip6("2001:db8::1".parse().unwrap()), "EHLO [IPv6:2001:db8::1]\r\n")]
    fn ehlo_command(#[case] client_name: ClientName, #[case] expected: &str) {
        assert_eq!(ehlo(&client_name), expected);
    }

    #[test]
    fn helo_and_lhlo_share_the_format() {
        let client_name = ClientName::Domain("client.example.com".parse().unwrap());
        assert_eq!(helo(&client_name), "HELO client.example.com\r\n");
        assert_eq!(lhlo(&client_name), "LHLO client.example.com\r\n");
    }

    #[test]
    fn mail_from_null_sender() {
        assert_eq!(mail_from(None, &MailParams::default()), "MAIL FROM:<>\r\n");
    }

    #[test]
    fn mail_from_with_every_parameter() {
        let params = MailParams {
            size: Some(48_213),
            body: Some(BodyType::EightBitMime),
            envelop_id: Some("id+1".to_owned()),
            ret: Some(DsnReturn::Full),
        };
        assert_eq!(
            mail_from(Some(&address("sender@example.com")), &params),
            "MAIL FROM:<sender@example.com> SIZE=48213 BODY=8BITMIME RET=FULL ENVID=id+2B1\r\n"
        );
    }

    #[test]
    fn mail_from_seven_bit() {
        let params = MailParams {
            body: Some(BodyType::SevenBit),
            ..MailParams::default()
        };
        assert_eq!(
            mail_from(Some(&address("sender@example.com")), &params),
            "MAIL FROM:<sender@example.com> BODY=7BIT\r\n"
        );
    }

    #[test]
    fn rcpt_to_bare() {
        assert_eq!(
            rcpt_to(&address("rcpt@example.com"), None, None),
            "RCPT TO:<rcpt@example.com>\r\n"
        );
    }

    #[test]
    fn rcpt_to_with_dsn() {
        let orcpt = OriginalRecipient {
            addr_type: "rfc822".to_owned(),
            mailbox: address("original=form@example.com"),
        };
        let notify_on = NotifyOn::Some {
            success: true,
            failure: true,
            delay: false,
        };
        assert_eq!(
            rcpt_to(&address("rcpt@example.com"), Some(&orcpt), Some(&notify_on)),
            "RCPT TO:<rcpt@example.com> ORCPT=rfc822;original+3Dform@example.com NOTIFY=SUCCESS,FAILURE\r\n"
        );
    }

    #[rstest]
    #[case::never(NotifyOn::Never, "NEVER")]
    #[case::nothing_requested(
        NotifyOn::Some {
            success: false,
            failure: false,
            delay: false,
        },
        "NEVER"
    )]
    #[case::delay_only(
        NotifyOn::Some {
            success: false,
            failure: false,
            delay: true,
        },
        "DELAY"
    )]
    fn notify_keywords(#[case] notify_on: NotifyOn, #[case] expected: &str) {
        assert_eq!(notify_on.to_string(), expected);
    }

    #[rstest]
    #[case::untouched("abc", "abc")]
    #[case::reserved("a+b=c", "a+2Bb+3Dc")]
    #[case::space_and_control("a b\u{1}", "a+20b+01")]
    #[case::eight_bit("déjà", "d+C3+A9j+C3+A0")]
    #[case::empty("", "")]
    fn xtext_encoding(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(xtext(input), expected);
    }

    #[test]
    fn xforward_skips_unaccepted_attributes() {
        let params = XforwardParams {
            name: Some("client.example.com".to_owned()),
            addr: Some("192.0.2.25".to_owned()),
            port: Some("54321".to_owned()),
            proto: Some("ESMTP".to_owned()),
            helo: Some("client".to_owned()),
        };
        let attrs = XforwardAttrs::from_keywords(["NAME", "PORT", "HELO"].into_iter());

        assert_eq!(
            xforward_name_addr(&params, attrs).as_deref(),
            Some("XFORWARD NAME=client.example.com PORT=54321\r\n")
        );
        assert_eq!(
            xforward_proto_helo(&params, attrs).as_deref(),
            Some("XFORWARD HELO=client\r\n")
        );
    }

    #[test]
    fn xforward_unknown_attribute_is_unavailable() {
        let params = XforwardParams {
            addr: Some("192.0.2.25".to_owned()),
            ..XforwardParams::default()
        };
        let attrs = XforwardAttrs::from_keywords(["NAME", "ADDR"].into_iter());

        assert_eq!(
            xforward_name_addr(&params, attrs).as_deref(),
            Some("XFORWARD NAME=[UNAVAILABLE] ADDR=192.0.2.25\r\n")
        );
    }

    #[test]
    fn xforward_nothing_accepted() {
        let params = XforwardParams::default();
        let attrs = XforwardAttrs::from_keywords(std::iter::empty());

        assert_eq!(xforward_name_addr(&params, attrs), None);
        assert_eq!(xforward_proto_helo(&params, attrs), None);
        assert!(!attrs.accepts_name_addr());
        assert!(!attrs.accepts_proto_helo());
    }
}
