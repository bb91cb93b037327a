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

use crate::types::reply_code::{ReplyCode, Severity};

/// One server reply, possibly accumulated from several `CCC-` lines.
///
/// `text` keeps every raw line as received (sanitized, code prefix
/// included), joined with `\n`. Diagnostics quote it as-is, the way a
/// postmaster expects to read a session transcript.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub struct Reply {
    code: ReplyCode,
    text: String,
    protocol_error: bool,
}

impl Reply {
    ///
    #[must_use]
    pub const fn code(&self) -> &ReplyCode {
        &self.code
    }

    /// Every line of the reply as received, code prefix included.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.split('\n')
    }

    ///
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// At least one line of this reply was not a valid status line.
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        self.protocol_error
    }

    ///
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.code.is_error()
    }

    ///
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.code.severity()
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Accumulates raw reply lines until the final one, bounding how much text a
/// chatty or hostile peer can make us keep. Lines past the cap are still
/// consumed, only their storage is dropped.
pub(crate) struct ReplyBuilder {
    cap: usize,
    text: String,
    code: Option<ReplyCode>,
    protocol_error: bool,
}

impl ReplyBuilder {
    pub(crate) const fn new(cap: usize) -> Self {
        Self {
            cap,
            text: String::new(),
            code: None,
            protocol_error: false,
        }
    }

    /// Feed one raw (already sanitized) line, without its terminator.
    /// Returns `true` once the terminating line has been seen.
    pub(crate) fn push_line(&mut self, line: &str) -> bool {
        if self.text.len() < self.cap {
            if !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str(line);
            self.text.truncate(self.cap);
        }

        match status_line(line) {
            // the terminating line wins, whatever earlier lines said.
            Some(true) => match ReplyCode::from_str(line) {
                Ok((code, _)) => {
                    self.code = Some(code);
                    true
                }
                Err(_) => {
                    self.protocol_error = true;
                    false
                }
            },
            Some(false) => false,
            None => {
                self.protocol_error = true;
                false
            }
        }
    }

    pub(crate) fn finish(self) -> Option<Reply> {
        self.code.map(|code| Reply {
            code,
            text: self.text,
            protocol_error: self.protocol_error,
        })
    }
}

/// `Some(true)` for a terminating status line, `Some(false)` for a
/// continuation, `None` when the line does not start with `DDD<sp|->`.
fn status_line(line: &str) -> Option<bool> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes.iter().take(3).all(u8::is_ascii_digit) {
        return None;
    }
    match bytes.get(3) {
        None | Some(b' ') => Some(true),
        Some(b'-') => Some(false),
        Some(_) => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplyFromStrError {
    #[error("reply has no terminating status line")]
    Incomplete,
}

impl std::str::FromStr for Reply {
    type Err = ReplyFromStrError;

    /// Parse a complete reply, lines separated by CRLF or LF.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut builder = ReplyBuilder::new(usize::MAX);
        for line in s.split("\r\n").flat_map(|part| part.split('\n')) {
            if line.is_empty() {
                continue;
            }
            if builder.push_line(line) {
                break;
            }
        }
        builder.finish().ok_or(ReplyFromStrError::Incomplete)
    }
}

impl fake::Dummy<fake::Faker> for Reply {
    fn dummy_with_rng<R: rand::Rng + ?Sized>(_: &fake::Faker, rng: &mut R) -> Self {
        use fake::Fake;

        let code: u16 = rng.gen_range(2..=5_u16) * 100 + rng.gen_range(0..60);
        let words = fake::faker::lorem::en::Words(3..7)
            .fake_with_rng::<Vec<String>, R>(rng)
            .join(" ");

        #[allow(clippy::unwrap_used)]
        format!("{code} {words}").parse().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::Fake;

    #[rstest::rstest]
    #[case("220 mail.example.com ESMTP\r\n", 220, false)]
    #[case("250 Ok", 250, false)]
    #[case("250-first\r\n250-second\r\n250 last\r\n", 250, false)]
    // a garbled middle line must not stop accumulation
    #[case("250-first\r\nsomething went wrong\r\n250 last\r\n", 250, true)]
    // the terminating line decides the code
    #[case("250-first\r\n452 too many recipients\r\n", 452, false)]
    fn parse(#[case] input: &str, #[case] code: u16, #[case] protocol_error: bool) {
        let reply = input.parse::<Reply>().unwrap();
        pretty_assertions::assert_eq!(reply.code().value(), code);
        pretty_assertions::assert_eq!(reply.is_protocol_error(), protocol_error);
    }

    #[test]
    fn incomplete() {
        "250-first\r\n250-second\r\n"
            .parse::<Reply>()
            .unwrap_err();
    }

    #[test]
    fn keeps_raw_lines() {
        let reply = "250-2.0.0 first\r\n250 2.0.0 done\r\n"
            .parse::<Reply>()
            .unwrap();
        pretty_assertions::assert_eq!(reply.text(), "250-2.0.0 first\n250 2.0.0 done");
        pretty_assertions::assert_eq!(reply.lines().count(), 2);
        pretty_assertions::assert_eq!(reply.code().details(), Some("2.0.0"));
    }

    #[test]
    fn capped_accumulation() {
        let mut builder = ReplyBuilder::new(16);
        assert!(!builder.push_line("250-aaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(builder.push_line("250 bbbb"));
        let reply = builder.finish().unwrap();
        pretty_assertions::assert_eq!(reply.text().len(), 16);
        pretty_assertions::assert_eq!(reply.code().value(), 250);
    }

    #[test]
    fn capped_to_empty() {
        let mut builder = ReplyBuilder::new(0);
        assert!(builder.push_line("250 Ok"));
        let reply = builder.finish().unwrap();
        pretty_assertions::assert_eq!(reply.text(), "");
        pretty_assertions::assert_eq!(reply.code().value(), 250);
    }

    #[test]
    fn serde_round_trip() {
        let reply: Reply = fake::Faker.fake();
        let json = serde_json::to_string(&reply).unwrap();
        let back = serde_json::from_str::<Reply>(&json).unwrap();
        pretty_assertions::assert_eq!(reply, back);
    }
}
