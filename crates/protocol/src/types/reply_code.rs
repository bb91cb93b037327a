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

/// First digit of a reply code, RFC 5321 section 4.2.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// 2yz, the requested action completed.
    PositiveCompletion,
    /// 3yz, the server wants more input (DATA answered 354).
    PositiveIntermediate,
    /// 4yz, the action was not taken but may succeed later.
    TransientNegative,
    /// 5yz, the action was not taken and retrying is pointless.
    PermanentNegative,
}

/// Code at the start of each line of a reply.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize, fake::Dummy)]
#[serde(untagged)]
pub enum ReplyCode {
    /// Bare three-digit code, RFC 5321.
    Code {
        /// code base
        code: u16,
    },
    /// Three-digit code with the RFC 2034 enhanced status appended.
    Enhanced {
        /// code base
        code: u16,
        /// `class.subject.detail`
        enhanced: String,
    },
}

impl ReplyCode {
    /// Whether the code denies the request (4yz or worse).
    #[must_use]
    #[inline]
    pub fn is_error(&self) -> bool {
        match self {
            Self::Code { code, .. } | Self::Enhanced { code, .. } => code / 100 >= 4,
        }
    }

    /// Class of the reply, from its first digit. Codes outside the ranges
    /// RFC 5321 allocates are reported as permanent errors, the caller has
    /// no sane way to retry on them.
    #[must_use]
    #[inline]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Code { code, .. } | Self::Enhanced { code, .. } => match *code / 100 {
                2 => Severity::PositiveCompletion,
                3 => Severity::PositiveIntermediate,
                4 => Severity::TransientNegative,
                _ => Severity::PermanentNegative,
            },
        }
    }

    /// The three-digit value.
    #[must_use]
    #[inline]
    pub const fn value(&self) -> u16 {
        match self {
            Self::Code { code, .. } | Self::Enhanced { code, .. } => *code,
        }
    }

    /// The enhanced status, when the server sent one.
    #[must_use]
    #[inline]
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Enhanced { enhanced, .. } => Some(enhanced),
            Self::Code { .. } => None,
        }
    }

    /// Exactly three digits.
    fn parse_base(word: &str) -> Option<u16> {
        if word.len() == 3 {
            word.parse().ok()
        } else {
            None
        }
    }

    /// `class.subject.detail`, each a decimal number.
    fn parse_status(word: &str) -> Option<String> {
        let mut parts = word.splitn(3, '.').map(str::parse::<u16>);
        let (class, subject, detail) = (
            parts.next()?.ok()?,
            parts.next()?.ok()?,
            parts.next()?.ok()?,
        );
        Some(format!("{class}.{subject}.{detail}"))
    }

    /// Split a raw status line into its code and the message after it.
    ///
    /// The separator may be a space or the `-` of a continuation line; an
    /// enhanced status directly after the code is folded into the result,
    /// anything else stays in the returned remainder untouched.
    #[allow(clippy::string_slice, clippy::indexing_slicing)]
    pub(crate) fn from_str(s: &str) -> Result<(Self, String), ReplyCodeFromStrError> {
        let mut words = s.split([' ', '-']);
        let Some(code) = words.next().and_then(Self::parse_base) else {
            return Err(ReplyCodeFromStrError::CannotParse { s: s.to_string() });
        };

        if let Some(status) = words.next().filter(|word| !word.is_empty()) {
            if let Some(enhanced) = Self::parse_status(status) {
                // the consumed length comes from the source, not from the
                // normalized status
                let consumed = 3 + 1 + status.len();
                return Ok((Self::Enhanced { code, enhanced }, s[consumed..].to_string()));
            }
        }
        Ok((Self::Code { code }, s[3..].to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplyCodeFromStrError {
    #[error("cannot parse {s:?}")]
    CannotParse { s: String },
}

impl std::fmt::Display for ReplyCode {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code { code } => write!(f, "{code}"),
            Self::Enhanced { code, enhanced } => write!(f, "{code} {enhanced}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Severity;
    use crate::ReplyCode;

    // NOTE: if the separator is `-`, it will not be included in the output of
    // `ReplyCode::to_string()` but is handled correctly by the reply reader.
    #[rstest::rstest]
    #[case(
        "250",
        (&ReplyCode::Code { code: 250 }, ""),
        "250"
    )]
    #[case(
        "452 4.5.3",
        (&ReplyCode::Enhanced {
            code: 452,
            enhanced: "4.5.3".to_owned(),
        },
        ""),
        "452 4.5.3",
    )]
    #[case(
        "250-2.0.0",
        (&ReplyCode::Enhanced {
            code: 250,
            enhanced: "2.0.0".to_owned(),
        },
        ""),
        "250 2.0.0",
    )]
    #[case(
        "250 ",
        (&ReplyCode::Code { code: 250 }, " "),
        "250"
    )]
    #[case(
        "452 4.5.3 Too many recipients",
        (&ReplyCode::Enhanced {
            code: 452,
            enhanced: "4.5.3".to_owned(),
        },
        " Too many recipients"),
        "452 4.5.3",
    )]
    #[case(
        "554 Transaction failed",
        (&ReplyCode::Code { code: 554 }, " Transaction failed"),
        "554"
    )]
    fn parse_reply(
        #[case] input: &str,
        #[case] expected: (&ReplyCode, &str),
        #[case] to_string: &str,
    ) {
        let (code, message) = ReplyCode::from_str(input).unwrap();
        pretty_assertions::assert_eq!(code, *expected.0);
        pretty_assertions::assert_eq!(code.to_string(), to_string);
        pretty_assertions::assert_eq!(message, expected.1);
    }

    #[rstest::rstest]
    #[case("junk")]
    #[case("25 Ok")]
    #[case("six hundred")]
    #[case("-50 what")]
    #[case("")]
    fn parse_garbage(#[case] input: &str) {
        ReplyCode::from_str(input).unwrap_err();
    }

    #[rstest::rstest]
    #[case(250, Severity::PositiveCompletion, false)]
    #[case(354, Severity::PositiveIntermediate, false)]
    #[case(452, Severity::TransientNegative, true)]
    #[case(550, Severity::PermanentNegative, true)]
    #[case(999, Severity::PermanentNegative, true)]
    fn severity(#[case] code: u16, #[case] expected: Severity, #[case] is_error: bool) {
        let code = ReplyCode::Code { code };
        pretty_assertions::assert_eq!(code.severity(), expected);
        pretty_assertions::assert_eq!(code.is_error(), is_error);
    }
}
