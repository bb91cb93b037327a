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

use strum::VariantNames;

/// An ESMTP keyword the server may advertise in its EHLO response.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    fake::Dummy,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
    strum::Display,
    strum::EnumString,
    strum::EnumVariantNames,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Extension {
    StartTls,
    Auth,
    Xforward,
    Pipelining,
    Size,
    #[strum(serialize = "8BITMIME")]
    BitMime8,
    #[strum(serialize = "DSN")]
    DeliveryStatusNotification,
    EnhancedStatusCodes,
    /// Anything advertised that we do not implement.
    Unknown,
}

/// Split an `EHLO` line into the keyword and whatever follows it.
///
/// Lines advertising nothing we know come back as [`Extension::Unknown`]
/// with the line untouched.
#[must_use]
pub fn from_str(input: &str) -> (Extension, &str) {
    for name in Extension::VARIANTS {
        if let Some(rest) = strip_keyword(input, name) {
            if let Ok(extension) = name.parse() {
                return (extension, rest);
            }
        }
    }
    (Extension::Unknown, input)
}

/// Strip `keyword` from the front of `line`, ignoring ASCII case.
fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    match line.get(..keyword.len()) {
        Some(head) if head.eq_ignore_ascii_case(keyword) => line.get(keyword.len()..),
        _ => None,
    }
}
